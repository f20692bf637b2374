//! The event kinds every core service publishes through the shared [`EventHub`](super::hub::EventHub).
//!
//! Per spec.md §9 ("every core service is an event source"), each component
//! gets its own variant carrying just enough identifying data for a listener
//! (the Dashboard Manager, an external log streamer) to react without
//! re-querying the service that published it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single published event, tagged by the component that emitted it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "component", content = "data")]
pub enum Event {
    Hierarchy(HierarchyEvent),
    StateMachine(StateMachineEvent),
    Session(SessionEvent),
    Task(TaskEvent),
    Conflict(ConflictEvent),
    FeatureFlag(FeatureFlagEvent),
    RateLimit(RateLimitEvent),
    Complexity(ComplexityEvent),
    Delegation(DelegationEvent),
    Plan(PlanEvent),
    Dashboard(DashboardEvent),
}

impl Event {
    /// Short, stable label used for log lines and sink formatting.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Event::Hierarchy(e) => e.label(),
            Event::StateMachine(e) => e.label(),
            Event::Session(e) => e.label(),
            Event::Task(e) => e.label(),
            Event::Conflict(e) => e.label(),
            Event::FeatureFlag(e) => e.label(),
            Event::RateLimit(e) => e.label(),
            Event::Complexity(e) => e.label(),
            Event::Delegation(e) => e.label(),
            Event::Plan(e) => e.label(),
            Event::Dashboard(e) => e.label(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum HierarchyEvent {
    Registered { agent_id: String, parent_id: Option<String>, depth: u32 },
    DelegationUpdated { delegation_id: String, from: String, to: String },
    NodeStatusChanged { agent_id: String, status: String },
    Pruned { agent_id: String, removed: Vec<String> },
}

impl HierarchyEvent {
    fn label(&self) -> &'static str {
        match self {
            HierarchyEvent::Registered { .. } => "hierarchy:registered",
            HierarchyEvent::DelegationUpdated { .. } => "delegation:updated",
            HierarchyEvent::NodeStatusChanged { .. } => "node:statusChanged",
            HierarchyEvent::Pruned { .. } => "hierarchy:pruned",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum StateMachineEvent {
    Registered { agent_id: String },
    Changed { agent_id: String, from: String, to: String, version: u64 },
    AtomicFamilyTransition { parent_id: String, member_count: usize },
}

impl StateMachineEvent {
    fn label(&self) -> &'static str {
        match self {
            StateMachineEvent::Registered { .. } => "agent:registered",
            StateMachineEvent::Changed { .. } => "state:changed",
            StateMachineEvent::AtomicFamilyTransition { .. } => "atomic-family-transition",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum SessionEvent {
    Registered { session_id: u64 },
    Updated { session_id: u64 },
    Deregistered { session_id: u64 },
    ChildAdded { parent_id: u64, child_id: u64 },
    DelegationAdded { session_id: u64, delegation_id: String },
    DelegationUpdated { session_id: u64, delegation_id: String, old_status: String, status: String },
    RollupUpdated { session_id: u64, source_session_id: u64, metric_type: String },
}

impl SessionEvent {
    fn label(&self) -> &'static str {
        match self {
            SessionEvent::Registered { .. } => "session:registered",
            SessionEvent::Updated { .. } => "session:updated",
            SessionEvent::Deregistered { .. } => "session:deregistered",
            SessionEvent::ChildAdded { .. } => "session:childAdded",
            SessionEvent::DelegationAdded { .. } => "delegation:added",
            SessionEvent::DelegationUpdated { .. } => "delegation:updated",
            SessionEvent::RollupUpdated { .. } => "session:rollupUpdated",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum TaskEvent {
    SubtaskCreated { parent_id: String, subtask_id: String },
    HierarchyProgress { parent_id: String, progress: Option<u8>, completed_count: u32 },
    Delegated { task_id: String, agent_id: String },
}

impl TaskEvent {
    fn label(&self) -> &'static str {
        match self {
            TaskEvent::SubtaskCreated { .. } => "task:subtask-created",
            TaskEvent::HierarchyProgress { .. } => "task:hierarchy-progress",
            TaskEvent::Delegated { .. } => "task:delegated",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ConflictEvent {
    Detected { conflict_id: String, resource: String },
    Resolved { conflict_id: String, resolution: String },
    Pruned { count: usize },
}

impl ConflictEvent {
    fn label(&self) -> &'static str {
        match self {
            ConflictEvent::Detected { .. } => "conflict:detected",
            ConflictEvent::Resolved { .. } => "conflict:resolved",
            ConflictEvent::Pruned { .. } => "conflicts:pruned",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum FeatureFlagEvent {
    Changed { name: String, value: bool },
    Reloaded { changed: Vec<String> },
}

impl FeatureFlagEvent {
    fn label(&self) -> &'static str {
        match self {
            FeatureFlagEvent::Changed { .. } => "flag:changed",
            FeatureFlagEvent::Reloaded { .. } => "flags:reloaded",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RateLimitEvent {
    LevelChanged { plan: String, level: String, utilization_percent: f64 },
}

impl RateLimitEvent {
    fn label(&self) -> &'static str {
        "rate-limit:level"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum ComplexityEvent {
    Analyzed { task_id: String, score: f64, strategy: String },
}

impl ComplexityEvent {
    fn label(&self) -> &'static str {
        "complexity:analyzed"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum DelegationEvent {
    Decided { task_id: String, should_delegate: bool, pattern: String },
}

impl DelegationEvent {
    fn label(&self) -> &'static str {
        "delegation:decided"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum PlanEvent {
    Evaluated { plan_title: String, total_score: f64 },
}

impl PlanEvent {
    fn label(&self) -> &'static str {
        "plan:evaluated"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum DashboardEvent {
    PlanUpdated { total_tasks: usize, completed_tasks: usize },
    ExecutionUpdated { phase: String },
    ArtifactAdded { id: String, name: String },
    MetricsUpdated { status: String },
}

impl DashboardEvent {
    fn label(&self) -> &'static str {
        match self {
            DashboardEvent::PlanUpdated { .. } => "plan:updated",
            DashboardEvent::ExecutionUpdated { .. } => "execution:updated",
            DashboardEvent::ArtifactAdded { .. } => "artifact:added",
            DashboardEvent::MetricsUpdated { .. } => "metrics:updated",
        }
    }
}

/// Envelope wrapping an [`Event`] with a server-assigned timestamp, used by
/// sinks that need an ordering key independent of payload contents.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimestampedEvent {
    pub when: DateTime<Utc>,
    pub event: Event,
}

impl TimestampedEvent {
    pub fn now(event: Event) -> Self {
        Self { when: Utc::now(), event }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind_label())
    }
}
