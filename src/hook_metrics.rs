//! Per-hook-kind execution metrics: counters, duration histograms, rolling
//! windows, and bounded snapshots (spec §4.B).

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default bucket upper bounds in milliseconds; the last bucket is implicitly `+inf`.
pub const DEFAULT_DURATION_BUCKETS_MS: [u64; 6] = [10, 50, 100, 500, 1000, 5000];

const RECENT_EXECUTIONS_CAPACITY: usize = 200;
const DURATION_SAMPLE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookKind {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    DelegationHook,
    TrackProgress,
    TrackUsage,
    AfterExecution,
    AfterCodeChange,
    ValidatePrompt,
}

impl HookKind {
    pub const ALL: [HookKind; 9] = [
        HookKind::SessionStart,
        HookKind::SessionEnd,
        HookKind::UserPromptSubmit,
        HookKind::DelegationHook,
        HookKind::TrackProgress,
        HookKind::TrackUsage,
        HookKind::AfterExecution,
        HookKind::AfterCodeChange,
        HookKind::ValidatePrompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::SessionStart => "session-start",
            HookKind::SessionEnd => "session-end",
            HookKind::UserPromptSubmit => "user-prompt-submit",
            HookKind::DelegationHook => "delegation-hook",
            HookKind::TrackProgress => "track-progress",
            HookKind::TrackUsage => "track-usage",
            HookKind::AfterExecution => "after-execution",
            HookKind::AfterCodeChange => "after-code-change",
            HookKind::ValidatePrompt => "validate-prompt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Timeout,
    ParseError,
    NetworkError,
    FileError,
    ValidationError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::Timeout,
        ErrorCategory::ParseError,
        ErrorCategory::NetworkError,
        ErrorCategory::FileError,
        ErrorCategory::ValidationError,
        ErrorCategory::Unknown,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RollingWindowKind {
    Minute,
    Hour,
    Day,
}

impl RollingWindowKind {
    fn duration(&self) -> Duration {
        match self {
            RollingWindowKind::Minute => Duration::from_secs(60),
            RollingWindowKind::Hour => Duration::from_secs(60 * 60),
            RollingWindowKind::Day => Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum HookMetricsError {
    #[error("failed to persist hook metrics: {0}")]
    Persist(#[source] io::Error),
    #[error("failed to load hook metrics: {0}")]
    Load(#[source] io::Error),
    #[error("failed to decode hook metrics: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DurationHistogram {
    bucket_counts: Vec<u64>,
    samples: VecDeque<u64>,
}

impl DurationHistogram {
    fn record(&mut self, duration_ms: u64) {
        if self.bucket_counts.is_empty() {
            self.bucket_counts = vec![0; DEFAULT_DURATION_BUCKETS_MS.len() + 1];
        }
        let bucket = DEFAULT_DURATION_BUCKETS_MS
            .iter()
            .position(|bound| duration_ms <= *bound)
            .unwrap_or(DEFAULT_DURATION_BUCKETS_MS.len());
        self.bucket_counts[bucket] += 1;
        if self.samples.len() == DURATION_SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(duration_ms);
    }

    fn summary(&self) -> DurationSummary {
        let count = self.samples.len();
        if count == 0 {
            return DurationSummary { count: 0, avg: 0.0, p50: 0, p95: 0 };
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        let avg = sum as f64 / count as f64;
        let p50 = sorted[(count - 1) * 50 / 100];
        let p95 = sorted[(count - 1) * 95 / 100];
        DurationSummary { count, avg, p50, p95 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DurationSummary {
    pub count: usize,
    pub avg: f64,
    pub p50: u64,
    pub p95: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollingWindow {
    #[serde(with = "system_time_secs")]
    window_start: SystemTime,
    success_count: u64,
    failure_count: u64,
}

mod system_time_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let secs = value.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        s.serialize_u64(secs)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

impl RollingWindow {
    fn new(kind: RollingWindowKind) -> Self {
        Self { window_start: now_rounded(kind), success_count: 0, failure_count: 0 }
    }

    fn maybe_roll(&mut self, kind: RollingWindowKind) {
        let now = SystemTime::now();
        if now.duration_since(self.window_start).unwrap_or_default() >= kind.duration() {
            self.window_start = now;
            self.success_count = 0;
            self.failure_count = 0;
        }
    }
}

fn now_rounded(_kind: RollingWindowKind) -> SystemTime {
    SystemTime::now()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingSuccessRate {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_executions: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PerKindStats {
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    retry_count: u64,
    duration: DurationHistogram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub total_executions: u64,
    pub success_rate: f64,
    pub duration: DurationSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub kind: HookKind,
    pub success: bool,
    pub duration_ms: u64,
    pub error_category: Option<ErrorCategory>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: String,
    pub taken_at: DateTime<Utc>,
    pub state: PersistedState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    per_kind: FxHashMap<HookKind, PerKindStats>,
    error_categories: FxHashMap<ErrorCategory, u64>,
    windows: FxHashMap<RollingWindowKind, RollingWindow>,
    recent: VecDeque<ExecutionRecord>,
}

pub struct HookMetrics {
    state: RwLock<PersistedState>,
    snapshots: RwLock<Vec<MetricsSnapshot>>,
    path: Option<PathBuf>,
}

impl HookMetrics {
    pub fn new() -> Self {
        Self { state: RwLock::new(PersistedState::default()), snapshots: RwLock::new(Vec::new()), path: None }
    }

    /// Load from `path` if it exists, otherwise start fresh; subsequent
    /// `persist()` calls target this path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HookMetricsError> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(HookMetricsError::Load)?;
            serde_json::from_str(&raw).map_err(HookMetricsError::Decode)?
        } else {
            PersistedState::default()
        };
        Ok(Self { state: RwLock::new(state), snapshots: RwLock::new(Vec::new()), path: Some(path) })
    }

    pub fn record_success(&self, kind: HookKind, duration_ms: u64) {
        let mut state = self.state.write();
        let stats = state.per_kind.entry(kind).or_default();
        stats.success_count += 1;
        stats.duration.record(duration_ms);
        for window_kind in [RollingWindowKind::Minute, RollingWindowKind::Hour, RollingWindowKind::Day] {
            let window = state.windows.entry(window_kind).or_insert_with(|| RollingWindow::new(window_kind));
            window.maybe_roll(window_kind);
            window.success_count += 1;
        }
        push_recent(&mut state.recent, ExecutionRecord {
            kind,
            success: true,
            duration_ms,
            error_category: None,
            at: Utc::now(),
        });
    }

    pub fn record_failure(&self, kind: HookKind, category: ErrorCategory, duration_ms: u64) {
        let mut state = self.state.write();
        let stats = state.per_kind.entry(kind).or_default();
        stats.failure_count += 1;
        stats.duration.record(duration_ms);
        if category == ErrorCategory::Timeout {
            stats.timeout_count += 1;
        }
        *state.error_categories.entry(category).or_insert(0) += 1;
        for window_kind in [RollingWindowKind::Minute, RollingWindowKind::Hour, RollingWindowKind::Day] {
            let window = state.windows.entry(window_kind).or_insert_with(|| RollingWindow::new(window_kind));
            window.maybe_roll(window_kind);
            window.failure_count += 1;
        }
        push_recent(&mut state.recent, ExecutionRecord {
            kind,
            success: false,
            duration_ms,
            error_category: Some(category),
            at: Utc::now(),
        });
    }

    pub fn record_retry(&self, kind: HookKind, _attempt_number: u32) {
        self.state.write().per_kind.entry(kind).or_default().retry_count += 1;
    }

    pub fn get_hook_stats(&self, kind: HookKind) -> HookStats {
        let state = self.state.read();
        let stats = state.per_kind.get(&kind).cloned().unwrap_or_default();
        let total = stats.success_count + stats.failure_count;
        let success_rate = if total == 0 { 100.0 } else { stats.success_count as f64 * 100.0 / total as f64 };
        HookStats {
            success_count: stats.success_count,
            failure_count: stats.failure_count,
            timeout_count: stats.timeout_count,
            total_executions: total,
            success_rate,
            duration: stats.duration.summary(),
        }
    }

    pub fn get_rolling_success_rate(&self, window: RollingWindowKind) -> Option<RollingSuccessRate> {
        let mut state = self.state.write();
        let entry = state.windows.entry(window).or_insert_with(|| RollingWindow::new(window));
        entry.maybe_roll(window);
        let total = entry.success_count + entry.failure_count;
        let success_rate = if total == 0 { 100.0 } else { entry.success_count as f64 * 100.0 / total as f64 };
        Some(RollingSuccessRate {
            success_count: entry.success_count,
            failure_count: entry.failure_count,
            total_executions: total,
            success_rate,
        })
    }

    pub fn take_snapshot(&self) -> MetricsSnapshot {
        let snapshot = MetricsSnapshot {
            id: Uuid::new_v4().to_string(),
            taken_at: Utc::now(),
            state: self.state.read().clone(),
        };
        self.snapshots.write().push(snapshot.clone());
        snapshot
    }

    pub fn get_snapshots(&self, since: Option<DateTime<Utc>>, limit: Option<usize>) -> Vec<MetricsSnapshot> {
        let snapshots = self.snapshots.read();
        let filtered = snapshots.iter().filter(|s| since.is_none_or(|since| s.taken_at >= since));
        match limit {
            Some(limit) => filtered.rev().take(limit).rev().cloned().collect(),
            None => filtered.cloned().collect(),
        }
    }

    /// Atomic temp-file-then-rename persistence, mirroring the Task Manager's
    /// durability contract.
    pub fn persist(&self) -> Result<(), HookMetricsError> {
        let Some(path) = &self.path else { return Ok(()) };
        let json = serde_json::to_string_pretty(&*self.state.read()).map_err(HookMetricsError::Decode)?;
        write_atomic(path, &json).map_err(HookMetricsError::Persist)
    }

    pub fn reset(&self) {
        *self.state.write() = PersistedState::default();
    }
}

impl Default for HookMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn push_recent(recent: &mut VecDeque<ExecutionRecord>, record: ExecutionRecord) {
    if recent.len() == RECENT_EXECUTIONS_CAPACITY {
        recent.pop_front();
    }
    recent.push_back(record);
}

fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_defaults_to_100_with_no_executions() {
        let metrics = HookMetrics::new();
        let stats = metrics.get_hook_stats(HookKind::SessionStart);
        assert_eq!(stats.success_rate, 100.0);
        assert_eq!(stats.total_executions, 0);
    }

    #[test]
    fn record_failure_with_timeout_bumps_timeout_counter() {
        let metrics = HookMetrics::new();
        metrics.record_failure(HookKind::TrackUsage, ErrorCategory::Timeout, 120);
        let stats = metrics.get_hook_stats(HookKind::TrackUsage);
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.failure_count, 1);
    }

    #[test]
    fn duration_histogram_buckets_into_default_bounds() {
        let metrics = HookMetrics::new();
        metrics.record_success(HookKind::AfterExecution, 5);
        metrics.record_success(HookKind::AfterExecution, 6000);
        let stats = metrics.get_hook_stats(HookKind::AfterExecution);
        assert_eq!(stats.duration.count, 2);
    }

    #[test]
    fn persist_then_reload_reproduces_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook-metrics.json");
        let metrics = HookMetrics::open(&path).unwrap();
        metrics.record_success(HookKind::SessionStart, 42);
        metrics.persist().unwrap();

        let reloaded = HookMetrics::open(&path).unwrap();
        let stats = reloaded.get_hook_stats(HookKind::SessionStart);
        assert_eq!(stats.success_count, 1);
    }

    #[test]
    fn reset_zeros_all_counters() {
        let metrics = HookMetrics::new();
        metrics.record_success(HookKind::SessionStart, 10);
        metrics.reset();
        assert_eq!(metrics.get_hook_stats(HookKind::SessionStart).total_executions, 0);
    }
}
