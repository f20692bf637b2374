//! Rolling minute/hour/day request and token windows against plan-based
//! ceilings, with a warning/critical/emergency threshold classifier (§4.C).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::event_bus::{EmitterError, Event, EventEmitter, RateLimitEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [WindowKind::Minute, WindowKind::Hour, WindowKind::Day];

    fn duration(&self) -> Duration {
        match self {
            WindowKind::Minute => Duration::from_secs(60),
            WindowKind::Hour => Duration::from_secs(60 * 60),
            WindowKind::Day => Duration::from_secs(24 * 60 * 60),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowLimits {
    pub requests: Option<u64>,
    pub tokens: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanLimits {
    pub minute: WindowLimits,
    pub hour: WindowLimits,
    pub day: WindowLimits,
}

impl PlanLimits {
    fn for_window(&self, kind: WindowKind) -> WindowLimits {
        match kind {
            WindowKind::Minute => self.minute,
            WindowKind::Hour => self.hour,
            WindowKind::Day => self.day,
        }
    }
}

/// Known plan names; unrecognized names fall back to `Free`'s limits with a warning.
pub fn plan_limits(plan: &str) -> PlanLimits {
    match plan {
        "Pro" => PlanLimits {
            minute: WindowLimits { requests: Some(60), tokens: Some(200_000) },
            hour: WindowLimits { requests: Some(1_500), tokens: None },
            day: WindowLimits { requests: Some(10_000), tokens: Some(5_000_000) },
        },
        "Team" => PlanLimits {
            minute: WindowLimits { requests: Some(200), tokens: Some(1_000_000) },
            hour: WindowLimits { requests: Some(6_000), tokens: None },
            day: WindowLimits { requests: Some(50_000), tokens: Some(25_000_000) },
        },
        "Free" => PlanLimits {
            minute: WindowLimits { requests: None, tokens: None },
            hour: WindowLimits { requests: None, tokens: None },
            day: WindowLimits { requests: Some(50), tokens: Some(100_000) },
        },
        other => {
            warn!(plan = other, "unknown rate-limit plan, falling back to Free");
            plan_limits("Free")
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { warning: 0.70, critical: 0.90, emergency: 0.98 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Ok,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Proceed,
    ProceedWithCaution,
    WrapUp,
    HaltImmediately,
}

#[derive(Debug, Clone)]
pub struct CallAssessment {
    pub level: Level,
    pub safe: bool,
    pub action: Action,
    pub utilization_percent: f64,
    pub limiting_factor: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Window {
    calls: u64,
    tokens: i64,
    reset_at: DateTime<Utc>,
}

impl Window {
    fn fresh(kind: WindowKind) -> Self {
        Self { calls: 0, tokens: 0, reset_at: Utc::now() + kind.duration() }
    }
}

#[derive(Debug, Clone)]
pub struct WindowStatus {
    pub kind: WindowKind,
    pub calls: u64,
    pub tokens: i64,
    pub reset_at: DateTime<Utc>,
}

pub struct RateLimitTracker {
    plan: String,
    limits: PlanLimits,
    thresholds: Thresholds,
    windows: RwLock<FxHashMap<WindowKind, Window>>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl RateLimitTracker {
    pub fn new(plan: impl Into<String>) -> Self {
        Self::with_overrides(plan, None, None)
    }

    pub fn with_overrides(plan: impl Into<String>, custom_limits: Option<PlanLimits>, thresholds: Option<Thresholds>) -> Self {
        let plan = plan.into();
        let limits = custom_limits.unwrap_or_else(|| plan_limits(&plan));
        let mut windows = FxHashMap::default();
        for kind in WindowKind::ALL {
            windows.insert(kind, Window::fresh(kind));
        }
        Self {
            plan,
            limits,
            thresholds: thresholds.unwrap_or_default(),
            windows: RwLock::new(windows),
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Record a completed call. Persistence (when wired to a coordination DB)
    /// never blocks tracking: a failure is logged and in-memory state continues.
    pub fn record_call(&self, tokens: i64) {
        self.reset_expired_windows();
        let mut windows = self.windows.write();
        for window in windows.values_mut() {
            window.calls += 1;
            window.tokens += tokens;
        }
    }

    pub fn can_make_call(&self, projected_tokens: i64) -> CallAssessment {
        self.reset_expired_windows();
        let windows = self.windows.read();
        let mut worst = (0.0_f64, String::new());
        for kind in WindowKind::ALL {
            let window = &windows[&kind];
            let limits = self.limits.for_window(kind);
            if let Some(limit) = limits.requests {
                let utilization = (window.calls + 1) as f64 / limit as f64;
                if utilization > worst.0 {
                    worst = (utilization, format!("requests/{}", kind.label()));
                }
            }
            if let Some(limit) = limits.tokens {
                let utilization = (window.tokens + projected_tokens) as f64 / limit as f64;
                if utilization > worst.0 {
                    worst = (utilization, format!("tokens/{}", kind.label()));
                }
            }
        }
        drop(windows);

        let (utilization, limiting_factor) = worst;
        let level = if utilization >= self.thresholds.emergency {
            Level::Emergency
        } else if utilization >= self.thresholds.critical {
            Level::Critical
        } else if utilization >= self.thresholds.warning {
            Level::Warning
        } else {
            Level::Ok
        };
        let (action, reason) = match level {
            Level::Ok => (Action::Proceed, format!("utilization at {:.1}% of {limiting_factor}, within budget", utilization * 100.0)),
            Level::Warning => (Action::ProceedWithCaution, format!("utilization at {:.1}% of {limiting_factor}, approaching the limit", utilization * 100.0)),
            Level::Critical => (Action::WrapUp, format!("utilization at {:.1}% of {limiting_factor}, wrap up remaining work", utilization * 100.0)),
            Level::Emergency => (Action::HaltImmediately, format!("utilization at {:.1}% of {limiting_factor}, halt immediately", utilization * 100.0)),
        };
        let safe = level != Level::Emergency;

        self.emit(Event::RateLimit(RateLimitEvent::LevelChanged {
            plan: self.plan.clone(),
            level: format!("{level:?}"),
            utilization_percent: utilization * 100.0,
        }));

        CallAssessment { level, safe, action, utilization_percent: utilization * 100.0, limiting_factor, reason }
    }

    fn reset_expired_windows(&self) {
        let now = Utc::now();
        let mut windows = self.windows.write();
        for (kind, window) in windows.iter_mut() {
            if window.reset_at <= now {
                *window = Window::fresh(*kind);
            }
        }
    }

    pub fn get_status(&self) -> Vec<WindowStatus> {
        self.reset_expired_windows();
        let windows = self.windows.read();
        WindowKind::ALL
            .into_iter()
            .map(|kind| {
                let window = &windows[&kind];
                WindowStatus { kind, calls: window.calls, tokens: window.tokens, reset_at: window.reset_at }
            })
            .collect()
    }

    /// Longest time remaining across windows whose limit is currently reached, else zero.
    pub fn get_time_until_available(&self) -> Duration {
        self.reset_expired_windows();
        let windows = self.windows.read();
        let now = Utc::now();
        let mut longest = Duration::ZERO;
        for kind in WindowKind::ALL {
            let window = &windows[&kind];
            let limits = self.limits.for_window(kind);
            let requests_maxed = limits.requests.is_some_and(|limit| window.calls >= limit);
            let tokens_maxed = limits.tokens.is_some_and(|limit| window.tokens >= limit);
            if requests_maxed || tokens_maxed {
                let remaining = (window.reset_at - now).to_std().unwrap_or(Duration::ZERO);
                longest = longest.max(remaining);
            }
        }
        longest
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(EmitterError::Other(err)) = emitter.emit(event)
        {
            warn!(error = %err, "failed to emit rate-limit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_plan_forty_calls_then_warning() {
        let tracker = RateLimitTracker::new("Free");
        for _ in 0..40 {
            tracker.record_call(1000);
        }
        let assessment = tracker.can_make_call(1000);
        assert_eq!(assessment.level, Level::Warning);
        assert!(assessment.safe);
        assert_eq!(assessment.action, Action::ProceedWithCaution);
    }

    #[test]
    fn level_monotonic_with_utilization() {
        let tracker = RateLimitTracker::new("Free");
        let ok = tracker.can_make_call(0);
        assert_eq!(ok.level, Level::Ok);

        for _ in 0..49 {
            tracker.record_call(0);
        }
        let emergency = tracker.can_make_call(0);
        assert_eq!(emergency.level, Level::Emergency);
        assert!(!emergency.safe);
    }

    #[test]
    fn unknown_plan_falls_back_to_free() {
        let limits = plan_limits("Mystery");
        assert_eq!(limits.day.requests, Some(50));
    }

    #[test]
    fn negative_tokens_accumulate_as_is() {
        let tracker = RateLimitTracker::new("Pro");
        tracker.record_call(-500);
        let status = tracker.get_status();
        let minute = status.iter().find(|s| matches!(s.kind, WindowKind::Minute)).unwrap();
        assert_eq!(minute.tokens, -500);
    }
}
