use proptest::prelude::*;
use swarmctl::config::HierarchyLimits;
use swarmctl::hierarchy::HierarchyRegistry;

proptest! {
    #[test]
    fn registering_a_chain_never_exceeds_max_depth_or_max_children(chain_len in 1usize..40) {
        let registry = HierarchyRegistry::new(HierarchyLimits { max_children: 4, max_depth: 8 });
        registry.register_hierarchy(None, "root", None).unwrap();

        let mut parent = "root".to_string();
        for i in 0..chain_len {
            let child = format!("n{i}");
            match registry.register_hierarchy(Some(&parent), &child, None) {
                Ok(()) => {
                    let node = registry.get_node(&child).unwrap();
                    prop_assert!(node.depth <= 8);
                    parent = child;
                }
                Err(_) => break,
            }
        }
    }

    #[test]
    fn every_registered_child_appears_in_its_parents_child_set_with_depth_plus_one(width in 1usize..10) {
        let registry = HierarchyRegistry::new(HierarchyLimits { max_children: 16, max_depth: 8 });
        registry.register_hierarchy(None, "root", None).unwrap();
        let root_depth = registry.get_node("root").unwrap().depth;

        let mut children = Vec::new();
        for i in 0..width {
            let child = format!("child-{i}");
            registry.register_hierarchy(Some("root"), &child, None).unwrap();
            children.push(child);
        }

        let root_node = registry.get_node("root").unwrap();
        for child in &children {
            prop_assert!(root_node.children.contains(child));
            prop_assert_eq!(registry.get_node(child).unwrap().depth, root_depth + 1);
        }
    }
}

#[test]
fn pruning_a_subtree_removes_it_and_every_descendant() {
    let registry = HierarchyRegistry::new(HierarchyLimits { max_children: 10, max_depth: 8 });
    registry.register_hierarchy(None, "root", None).unwrap();
    registry.register_hierarchy(Some("root"), "mid", None).unwrap();
    registry.register_hierarchy(Some("mid"), "leaf", None).unwrap();

    let (pruned, removed) = registry.prune_hierarchy("mid");
    assert!(pruned);
    assert_eq!(removed.len(), 2);
    assert!(registry.get_node("mid").is_none());
    assert!(registry.get_node("leaf").is_none());
    assert!(registry.get_node("root").is_some());
}
