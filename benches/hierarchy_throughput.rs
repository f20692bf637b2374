use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use swarmctl::config::HierarchyLimits;
use swarmctl::hierarchy::HierarchyRegistry;

const FANOUTS: &[usize] = &[16, 64, 256];

fn register_fanout(size: usize) {
    let registry = HierarchyRegistry::new(HierarchyLimits {
        max_children: size,
        max_depth: 16,
    });
    registry.register_hierarchy(None, "root", None).expect("root");
    for i in 0..size {
        registry
            .register_hierarchy(Some("root"), &format!("child-{i}"), None)
            .expect("child");
    }
}

fn hierarchy_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("hierarchy_register");

    for &size in FANOUTS {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| register_fanout(size));
        });
    }

    group.finish();
}

criterion_group!(benches, hierarchy_throughput);
criterion_main!(benches);
