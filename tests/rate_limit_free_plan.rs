use swarmctl::rate_limit::{Action, Level, RateLimitTracker};

#[test]
fn forty_calls_on_the_free_plan_trip_the_warning_band() {
    let tracker = RateLimitTracker::new("Free");
    for _ in 0..40 {
        tracker.record_call(1000);
    }

    let assessment = tracker.can_make_call(1000);
    assert_eq!(assessment.level, Level::Warning);
    assert!(assessment.safe);
    assert_eq!(assessment.action, Action::ProceedWithCaution);
}
