//! Read-through aggregator exposing a single state snapshot and bounded
//! event timeline for a monitoring dashboard to render (spec §4.L).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event_bus::{DashboardEvent, EmitterError, Event, EventEmitter};

const MAX_ARTIFACTS: usize = 100;
const MAX_TIMELINE: usize = 50;

/// External token/cost accounting the dashboard reads through on each
/// refresh tick; the real tracker lives outside the core (spec §6).
pub trait UsageSource: Send + Sync {
    fn usage(&self) -> UsageSnapshot;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSnapshot {
    pub tokens: f64,
    pub cost: f64,
    pub limit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Ok,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub current: f64,
    pub limit: f64,
    pub percentage: f64,
    pub status: ContextStatus,
    pub next_checkpoint: Option<f64>,
}

impl Default for ContextSnapshot {
    fn default() -> Self {
        Self { current: 0.0, limit: 0.0, percentage: 0.0, status: ContextStatus::Ok, next_checkpoint: None }
    }
}

fn classify_context(current: f64, limit: f64) -> ContextSnapshot {
    if limit <= 0.0 {
        return ContextSnapshot::default();
    }
    let percentage = (current / limit) * 100.0;
    let status = if percentage >= 95.0 {
        ContextStatus::Emergency
    } else if percentage >= 85.0 {
        ContextStatus::Critical
    } else if percentage >= 80.0 {
        ContextStatus::Warning
    } else {
        ContextStatus::Ok
    };
    let next_checkpoint = if percentage < 85.0 { Some(limit * 0.85 - current) } else { None };
    ContextSnapshot { current, limit, percentage, status, next_checkpoint }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageState {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTaskEntry {
    pub id: String,
    pub content: String,
    pub status: String,
    pub active_form: Option<String>,
    pub progress: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanState {
    pub tasks: Vec<PlanTaskEntry>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub current_task_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub phase: String,
    pub agent: Option<String>,
    pub task: Option<String>,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    pub path: String,
    pub artifact_type: Option<String>,
    pub description: Option<String>,
    pub phase: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewArtifact {
    pub name: String,
    pub path: String,
    pub artifact_type: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub event_type: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardStatus {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub status: DashboardStatus,
    pub session: Option<serde_json::Value>,
    pub context: ContextSnapshot,
    pub usage: UsageState,
    pub execution: Option<ExecutionState>,
    pub plan: PlanState,
    pub artifacts: Vec<Artifact>,
    pub events: Vec<TimelineEvent>,
}

impl Default for DashboardSnapshot {
    fn default() -> Self {
        Self {
            status: DashboardStatus::Idle,
            session: None,
            context: ContextSnapshot::default(),
            usage: UsageState::default(),
            execution: None,
            plan: PlanState::default(),
            artifacts: Vec::new(),
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub phase: String,
    pub agent: Option<String>,
    pub task: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

pub struct DashboardManager {
    state: RwLock<DashboardSnapshot>,
    update_interval: Duration,
    usage_source: Option<Arc<dyn UsageSource>>,
    emitter: Option<Arc<dyn EventEmitter>>,
    refresh_handle: RwLock<Option<JoinHandle<()>>>,
    shutdown: RwLock<Option<watch::Sender<bool>>>,
    running: AtomicBool,
}

impl DashboardManager {
    pub fn new(update_interval: Duration) -> Self {
        Self {
            state: RwLock::new(DashboardSnapshot::default()),
            update_interval,
            usage_source: None,
            emitter: None,
            refresh_handle: RwLock::new(None),
            shutdown: RwLock::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_usage_source(mut self, source: Arc<dyn UsageSource>) -> Self {
        self.usage_source = Some(source);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn update_execution_plan(&self, tasks: Vec<PlanTaskEntry>, current_index: Option<usize>) {
        let total_tasks = tasks.len();
        let completed_tasks = tasks.iter().filter(|t| t.status == "completed").count();
        {
            let mut state = self.state.write();
            state.plan = PlanState { tasks, total_tasks, completed_tasks, current_task_index: current_index };
        }
        self.emit(Event::Dashboard(DashboardEvent::PlanUpdated { total_tasks, completed_tasks }));
    }

    pub fn update_execution(&self, update: ExecutionUpdate) {
        let start_time = update.start_time.unwrap_or_else(Utc::now);
        let duration_ms = (Utc::now() - start_time).num_milliseconds().max(0);
        let phase = update.phase.clone();
        {
            let mut state = self.state.write();
            state.execution = Some(ExecutionState {
                phase: update.phase,
                agent: update.agent,
                task: update.task,
                start_time,
                duration_ms,
            });
        }
        self.emit(Event::Dashboard(DashboardEvent::ExecutionUpdated { phase }));
    }

    /// Recomputes `duration` against the currently-running execution without
    /// replacing its identity, mirroring the "recomputed on each call" contract.
    pub fn refresh_execution_duration(&self) {
        let mut state = self.state.write();
        if let Some(execution) = state.execution.as_mut() {
            execution.duration_ms = (Utc::now() - execution.start_time).num_milliseconds().max(0);
        }
    }

    pub fn add_artifact(&self, artifact: NewArtifact) -> Artifact {
        let phase = self.state.read().execution.as_ref().map(|e| e.phase.clone()).unwrap_or_default();
        let record = Artifact {
            id: Uuid::new_v4().to_string(),
            name: artifact.name,
            path: artifact.path,
            artifact_type: artifact.artifact_type,
            description: artifact.description,
            phase,
            created_at: Utc::now(),
        };
        {
            let mut state = self.state.write();
            state.artifacts.insert(0, record.clone());
            state.artifacts.truncate(MAX_ARTIFACTS);
        }
        self.emit(Event::Dashboard(DashboardEvent::ArtifactAdded { id: record.id.clone(), name: record.name.clone() }));
        record
    }

    fn add_event(&self, event_type: &str, message: &str, data: Option<serde_json::Value>) {
        let entry = TimelineEvent {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            message: message.to_string(),
            data,
            at: Utc::now(),
        };
        let mut state = self.state.write();
        state.events.insert(0, entry);
        state.events.truncate(MAX_TIMELINE);
    }

    /// Recomputes token/cost/context numbers from the usage source and
    /// publishes `metrics:updated`. Called by the periodic refresh loop and
    /// available for callers that drive their own tick.
    pub fn refresh_metrics(&self) {
        let Some(source) = &self.usage_source else { return };
        let usage = source.usage();
        let context = classify_context(usage.tokens, usage.limit);
        let status_label = format!("{:?}", context.status).to_lowercase();
        {
            let mut state = self.state.write();
            state.context = context;
        }
        self.emit(Event::Dashboard(DashboardEvent::MetricsUpdated { status: status_label }));
    }

    pub fn get_state(&self) -> DashboardSnapshot {
        self.state.read().clone()
    }

    pub fn on_orchestrator_execution_start(&self, phase: impl Into<String>, agent: Option<String>, task: Option<String>) {
        let phase = phase.into();
        self.update_execution(ExecutionUpdate { phase: phase.clone(), agent, task, start_time: Some(Utc::now()) });
        self.state.write().usage.total_operations += 1;
        self.add_event("orchestrator:execution:start", &format!("execution started: {phase}"), None);
    }

    pub fn on_orchestrator_execution_complete(&self) {
        self.state.write().usage.successful_operations += 1;
        self.add_event("orchestrator:execution:complete", "execution completed", None);
    }

    pub fn on_orchestrator_execution_error(&self, error: &str) {
        self.state.write().usage.failed_operations += 1;
        self.add_event("orchestrator:execution:error", error, None);
    }

    /// Starts the periodic refresh timer. Idempotent: a second call while
    /// already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.write().status = DashboardStatus::Running;
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.write() = Some(tx);

        let manager = Arc::clone(self);
        let interval_dur = self.update_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval_dur);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.refresh_metrics();
                        manager.refresh_execution_duration();
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *self.refresh_handle.write() = Some(handle);
    }

    /// Stops the refresh timer; guaranteed not to fire again after this returns.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.write().take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.refresh_handle.write().take() {
            handle.abort();
        }
        self.state.write().status = DashboardStatus::Stopped;
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
            && !matches!(err, EmitterError::Closed)
        {
            tracing::warn!(error = %err, "failed to emit dashboard event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_status_thresholds_match_spec() {
        assert_eq!(classify_context(500.0, 1000.0).status, ContextStatus::Ok);
        assert_eq!(classify_context(800.0, 1000.0).status, ContextStatus::Warning);
        assert_eq!(classify_context(850.0, 1000.0).status, ContextStatus::Critical);
        assert_eq!(classify_context(950.0, 1000.0).status, ContextStatus::Emergency);
    }

    #[test]
    fn next_checkpoint_only_present_below_85_percent() {
        let below = classify_context(500.0, 1000.0);
        assert_eq!(below.next_checkpoint, Some(350.0));
        let above = classify_context(900.0, 1000.0);
        assert_eq!(above.next_checkpoint, None);
    }

    #[test]
    fn execution_plan_recomputes_totals() {
        let dashboard = DashboardManager::new(Duration::from_secs(5));
        dashboard.update_execution_plan(
            vec![
                PlanTaskEntry { id: "1".into(), content: "a".into(), status: "completed".into(), active_form: None, progress: Some(100) },
                PlanTaskEntry { id: "2".into(), content: "b".into(), status: "pending".into(), active_form: None, progress: None },
            ],
            Some(1),
        );
        let state = dashboard.get_state();
        assert_eq!(state.plan.total_tasks, 2);
        assert_eq!(state.plan.completed_tasks, 1);
    }

    #[test]
    fn artifacts_are_bounded_and_newest_first() {
        let dashboard = DashboardManager::new(Duration::from_secs(5));
        for i in 0..(MAX_ARTIFACTS + 5) {
            dashboard.add_artifact(NewArtifact { name: format!("a{i}"), path: format!("/tmp/{i}"), ..Default::default() });
        }
        let state = dashboard.get_state();
        assert_eq!(state.artifacts.len(), MAX_ARTIFACTS);
        assert_eq!(state.artifacts[0].name, format!("a{}", MAX_ARTIFACTS + 4));
    }

    #[test]
    fn get_state_is_a_deep_copy() {
        let dashboard = DashboardManager::new(Duration::from_secs(5));
        let mut snapshot = dashboard.get_state();
        snapshot.usage.total_operations = 99;
        assert_eq!(dashboard.get_state().usage.total_operations, 0);
    }
}
