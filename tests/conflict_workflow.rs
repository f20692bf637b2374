use swarmctl::coordination_db::{ConflictType, CoordinationDb, RecordConflictProps, Resolution, ResolveOptions};
use std::time::Duration;

#[test]
fn resolving_a_conflict_twice_is_refused_the_second_time() {
    let db = CoordinationDb::new(Duration::from_secs(30), Duration::from_secs(600));

    let conflict = db.record_conflict(RecordConflictProps {
        conflict_type: ConflictType::parse("VERSION_CONFLICT").unwrap(),
        resource: "tasks.json".to_string(),
        session_a_id: "s1".to_string(),
        session_a_version: 5,
        session_b_id: "s2".to_string(),
        session_b_version: 7,
        ..Default::default()
    });
    assert_eq!(db.get_conflict(&conflict.id).unwrap().status, swarmctl::coordination_db::ConflictStatus::Pending);

    let outcome = db.resolve_conflict(&conflict.id, Resolution::VersionB, ResolveOptions::default());
    assert!(outcome.success);
    assert_eq!(db.get_conflict(&conflict.id).unwrap().status, swarmctl::coordination_db::ConflictStatus::Resolved);

    let second = db.resolve_conflict(&conflict.id, Resolution::VersionA, ResolveOptions::default());
    assert!(!second.success);
    assert_eq!(second.error.as_deref(), Some("ALREADY_RESOLVED"));
    assert_eq!(db.get_conflict(&conflict.id).unwrap().resolution, Some(Resolution::VersionB));
}

#[test]
fn a_stale_lock_is_reclaimed_but_a_live_lock_is_refused() {
    let db = CoordinationDb::new(Duration::from_millis(20), Duration::from_secs(600));

    let (outcome, lock) = db.acquire_lock("tasks.json", "s1");
    assert!(matches!(outcome, swarmctl::coordination_db::LockOutcome::Acquired));
    assert_eq!(lock.holder_session_id, "s1");

    let (refused, _) = db.acquire_lock("tasks.json", "s2");
    assert!(matches!(refused, swarmctl::coordination_db::LockOutcome::Refused));

    std::thread::sleep(Duration::from_millis(40));

    let (reclaimed, lock) = db.acquire_lock("tasks.json", "s2");
    assert!(matches!(reclaimed, swarmctl::coordination_db::LockOutcome::Reclaimed));
    assert_eq!(lock.holder_session_id, "s2");
}
