use swarmctl::state_machine::{AgentState, HierarchicalStateMachine};
use std::time::Duration;

#[test]
fn rejecting_an_illegal_transition_leaves_the_whole_family_untouched() {
    let machine = HierarchicalStateMachine::new(2048, 256, Duration::from_secs(1800));
    machine.register("p", None, None).unwrap();
    machine.register("c1", Some("p"), None).unwrap();
    machine.register("c2", Some("p"), None).unwrap();

    let err = machine
        .atomic_family_transition("p", AgentState::Completed, AgentState::Completed)
        .unwrap_err();
    assert!(matches!(err, swarmctl::state_machine::StateMachineError::InvalidTransition { .. }));

    for agent_id in ["p", "c1", "c2"] {
        let entry = machine.get_state(agent_id).unwrap();
        assert_eq!(entry.state, AgentState::Idle);
        assert_eq!(entry.version, 1);
    }
}
