//! Registers a session, walks an agent through its state machine lifecycle,
//! and reads back the roll-up metrics a dashboard would poll.

use swarmctl::config::ControlPlaneConfig;
use swarmctl::control_plane::ControlPlane;
use swarmctl::session_registry::RegisterSession;
use swarmctl::state_machine::{AgentState, UpdateOptions};

fn main() {
    swarmctl::telemetry::init_tracing();

    let plane = ControlPlane::new(ControlPlaneConfig::default());

    let session_id = plane.session_registry.register(RegisterSession {
        project: "swarmctl-demo".to_string(),
        path: Some("/workspace/swarmctl-demo".to_string()),
        session_type: Some("cli".to_string()),
        tokens: 0.0,
        cost: 0.0,
        quality_score: 0.0,
        ..Default::default()
    });
    println!("registered session {session_id}");

    plane
        .hierarchy
        .register_hierarchy(None, "root-agent", None)
        .expect("root agent registers once");
    plane
        .state_machine
        .register("root-agent", None, None)
        .expect("root agent state registers once");

    let entry = plane
        .state_machine
        .update_state("root-agent", AgentState::Initializing, UpdateOptions::default())
        .expect("idle -> initializing is legal");
    println!("root-agent is now {:?} (version {})", entry.state, entry.version);

    let entry = plane
        .state_machine
        .update_state("root-agent", AgentState::Active, UpdateOptions::default())
        .expect("initializing -> active is legal");
    println!("root-agent is now {:?} (version {})", entry.state, entry.version);

    let session = plane.session_registry.get(session_id).expect("session exists");
    println!("session record: {session:?}");

    let summary = plane.session_registry.get_summary();
    println!("registry summary: {summary:?}");
}
