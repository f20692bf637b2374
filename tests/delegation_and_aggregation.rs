use swarmctl::delegation::{AgentCapability, DelegationDecider, DelegationPattern};
use swarmctl::complexity::ComplexityAnalyzer;
use swarmctl::task_manager::{CreateTaskProps, SubtaskOverrides, TaskManager};
use std::sync::Arc;

#[test]
fn a_one_line_fix_is_never_delegated() {
    let complexity = Arc::new(ComplexityAnalyzer::new());
    let decider = DelegationDecider::new(complexity);
    let manager = TaskManager::new();

    let task = manager.create_task(CreateTaskProps {
        title: "Fix typo".to_string(),
        description: "Fix typo in README".to_string(),
        estimate: Some("5m".to_string()),
        ..Default::default()
    });

    let decision = decider.decide(&task, &AgentCapability::default(), false);
    assert!(!decision.should_delegate);
    assert_eq!(decision.suggested_pattern, DelegationPattern::Direct);
    assert!(decision.factors.subtask_count < 2.0);
}

#[test]
fn average_aggregation_tracks_completed_fraction_across_three_subtasks() {
    let manager = TaskManager::new();
    let parent = manager.create_task(CreateTaskProps {
        title: "Parent".to_string(),
        description: "Parent task".to_string(),
        phase: "implementation".to_string(),
        ..Default::default()
    });

    let s1 = manager.create_subtask(&parent.id, SubtaskOverrides { title: "S1".to_string(), ..Default::default() }).unwrap();
    let s2 = manager.create_subtask(&parent.id, SubtaskOverrides { title: "S2".to_string(), ..Default::default() }).unwrap();
    let s3 = manager.create_subtask(&parent.id, SubtaskOverrides { title: "S3".to_string(), ..Default::default() }).unwrap();

    manager.update_status(&s1.id, "completed").unwrap();
    assert_eq!(manager.get_task(&parent.id).unwrap().progress, Some(33));

    manager.update_status(&s2.id, "completed").unwrap();
    assert_eq!(manager.get_task(&parent.id).unwrap().progress, Some(66));

    manager.update_status(&s3.id, "completed").unwrap();
    assert_eq!(manager.get_task(&parent.id).unwrap().progress, Some(100));
}
