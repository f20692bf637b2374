//! Creates a task, asks the control plane whether it should be delegated to
//! a child agent, and (if so) spawns that child in the hierarchy/state
//! machine the way an orchestrator would after accepting the decision.

use swarmctl::config::ControlPlaneConfig;
use swarmctl::control_plane::ControlPlane;
use swarmctl::delegation::AgentCapability;
use swarmctl::task_manager::CreateTaskProps;

fn main() {
    swarmctl::telemetry::init_tracing();

    let plane = ControlPlane::new(ControlPlaneConfig::default());
    plane
        .hierarchy
        .register_hierarchy(None, "root-agent", None)
        .expect("root agent registers once");

    let task = plane.task_manager.create_task(CreateTaskProps {
        title: "Migrate billing service to the new event schema".to_string(),
        description: "Touches seven modules, two downstream consumers, and a database migration."
            .to_string(),
        phase: "implementation".to_string(),
        estimate: Some("3d".to_string()),
        ..Default::default()
    });
    println!("created task {} ({})", task.id, task.title);

    let agent = AgentCapability {
        confidence: Some(0.4),
        required_capability_match: Some(0.5),
        phase_matches: true,
        queue_depth: Some(3),
        max_queue_depth: Some(5),
        child_agent_count: Some(1),
        max_children: Some(10),
        context_used_fraction: 0.2,
        hierarchy_depth: 0,
    };

    let decision = plane.evaluate_delegation(&task, "root-agent", agent);
    println!(
        "delegate={} score={:.2} pattern={:?} reasoning={}",
        decision.should_delegate, decision.score, decision.suggested_pattern, decision.reasoning
    );

    if decision.should_delegate {
        plane
            .spawn_child_agent("root-agent", "child-agent-1")
            .expect("hierarchy has capacity for one more child");
        println!("spawned child-agent-1 under root-agent");
    }
}
