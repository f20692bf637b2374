//! Cross-session directory with parent/child linkage, delegation lists, and
//! lazily-recomputed roll-up metrics (spec §4.G).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_bus::{EmitterError, Event, EventEmitter, SessionEvent};

const MAX_COMPLETED_DELEGATIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorInfo {
    pub version: String,
    pub start_time: DateTime<Utc>,
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HierarchyInfo {
    pub is_root: bool,
    pub parent_session_id: Option<u64>,
    pub child_session_ids: Vec<u64>,
    pub delegation_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl DelegationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DelegationStatus::Completed | DelegationStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDelegation {
    pub id: String,
    pub status: DelegationStatus,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub tokens: f64,
    pub cost: f64,
    pub quality_score: f64,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollupMetrics {
    pub total_tokens: f64,
    pub total_cost: f64,
    pub avg_quality: f64,
    pub total_agent_count: u64,
    pub child_session_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub project: String,
    pub path: Option<String>,
    pub session_type: String,
    pub autonomous: bool,
    pub status: SessionStatus,
    pub orchestrator_info: Option<OrchestratorInfo>,
    pub log_session_id: Option<String>,
    pub hierarchy_info: HierarchyInfo,
    pub active_delegations: Vec<SessionDelegation>,
    pub completed_delegations: Vec<SessionDelegation>,
    pub rollup_metrics: RollupMetrics,
    pub metrics: SessionMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterSession {
    pub project: String,
    pub path: Option<String>,
    pub session_type: Option<String>,
    pub autonomous: Option<bool>,
    pub orchestrator_info: Option<OrchestratorInfo>,
    pub log_session_id: Option<String>,
    pub parent_session_id: Option<u64>,
    pub tokens: f64,
    pub cost: f64,
    pub quality_score: f64,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub ended: usize,
}

#[derive(Debug, Clone)]
pub struct HierarchyMetrics {
    pub root_session_count: usize,
    pub sessions_with_children: usize,
}

#[derive(Debug, Clone)]
pub struct RootSessionSummary {
    pub id: u64,
    pub child_count: usize,
}

#[derive(Debug, Clone)]
pub struct SummaryWithHierarchy {
    pub summary: SessionSummary,
    pub hierarchy_metrics: HierarchyMetrics,
    pub root_sessions: Vec<RootSessionSummary>,
}

pub struct SessionRegistry {
    sessions: parking_lot::RwLock<FxHashMap<u64, Session>>,
    next_id: AtomicU64,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: parking_lot::RwLock::new(FxHashMap::default()), next_id: AtomicU64::new(1), emitter: None }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    #[tracing::instrument(skip(self, props), fields(project = %props.project))]
    pub fn register(&self, props: RegisterSession) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session_type = props.session_type.unwrap_or_else(|| "cli".to_string());
        let autonomous = props.autonomous.unwrap_or_else(|| session_type == "autonomous" || session_type == "loop");
        let now = Utc::now();

        let hierarchy_info = HierarchyInfo {
            is_root: props.parent_session_id.is_none(),
            parent_session_id: props.parent_session_id,
            child_session_ids: Vec::new(),
            delegation_depth: 0,
        };

        let session = Session {
            id,
            project: props.project,
            path: props.path,
            session_type,
            autonomous,
            status: SessionStatus::Active,
            orchestrator_info: props.orchestrator_info,
            log_session_id: props.log_session_id,
            hierarchy_info,
            active_delegations: Vec::new(),
            completed_delegations: Vec::new(),
            rollup_metrics: RollupMetrics::default(),
            metrics: SessionMetrics { tokens: props.tokens, cost: props.cost, quality_score: props.quality_score, confidence_score: 0.0 },
            created_at: now,
            updated_at: now,
        };

        let mut sessions = self.sessions.write();
        sessions.insert(id, session);

        if let Some(parent_id) = props.parent_session_id
            && let Some(parent) = sessions.get_mut(&parent_id)
        {
            parent.hierarchy_info.child_session_ids.push(id);
            parent.rollup_metrics.child_session_count += 1;
            parent.updated_at = now;
            drop(sessions);
            self.emit(Event::Session(SessionEvent::ChildAdded { parent_id, child_id: id }));
        }

        self.emit(Event::Session(SessionEvent::Registered { session_id: id }));
        id
    }

    pub fn get(&self, id: u64) -> Option<Session> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn update(&self, id: u64, changes: impl FnOnce(&mut Session)) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id)?;
        let preserved_type = session.session_type.clone();
        let preserved_log_id = session.log_session_id.clone();
        let preserved_hierarchy = session.hierarchy_info.clone();
        changes(session);
        session.session_type = preserved_type;
        session.log_session_id = preserved_log_id;
        session.hierarchy_info = preserved_hierarchy;
        session.updated_at = Utc::now();
        let updated = session.clone();
        drop(sessions);
        self.emit(Event::Session(SessionEvent::Updated { session_id: id }));
        Some(updated)
    }

    pub fn deregister(&self, id: u64) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id)?;
        session.status = SessionStatus::Ended;
        session.updated_at = Utc::now();
        let snapshot = session.clone();
        drop(sessions);
        self.emit(Event::Session(SessionEvent::Deregistered { session_id: id }));
        Some(snapshot)
    }

    pub fn add_delegation(&self, id: u64, data: serde_json::Value) -> Option<SessionDelegation> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id)?;
        let delegation = SessionDelegation {
            id: Uuid::new_v4().to_string(),
            status: DelegationStatus::Pending,
            data,
            created_at: Utc::now(),
            completed_at: None,
        };
        session.active_delegations.push(delegation.clone());
        drop(sessions);
        self.emit(Event::Session(SessionEvent::DelegationAdded { session_id: id, delegation_id: delegation.id.clone() }));
        Some(delegation)
    }

    pub fn update_delegation(&self, session_id: u64, delegation_id: &str, status: DelegationStatus) -> Option<SessionDelegation> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&session_id)?;
        let idx = session.active_delegations.iter().position(|d| d.id == delegation_id)?;
        let old_status = session.active_delegations[idx].status.clone();
        session.active_delegations[idx].status = status.clone();

        let updated = if status.is_terminal() {
            let mut delegation = session.active_delegations.remove(idx);
            delegation.completed_at = Some(Utc::now());
            session.completed_delegations.push(delegation.clone());
            if session.completed_delegations.len() > MAX_COMPLETED_DELEGATIONS {
                let overflow = session.completed_delegations.len() - MAX_COMPLETED_DELEGATIONS;
                session.completed_delegations.drain(0..overflow);
            }
            delegation
        } else {
            session.active_delegations[idx].clone()
        };
        drop(sessions);
        self.emit(Event::Session(SessionEvent::DelegationUpdated {
            session_id,
            delegation_id: delegation_id.to_string(),
            old_status: format!("{old_status:?}"),
            status: format!("{status:?}"),
        }));
        Some(updated)
    }

    pub fn get_completed_delegations(&self, id: u64, limit: Option<usize>) -> Vec<SessionDelegation> {
        let sessions = self.sessions.read();
        let Some(session) = sessions.get(&id) else { return Vec::new() };
        let mut reversed: Vec<SessionDelegation> = session.completed_delegations.iter().rev().cloned().collect();
        if let Some(limit) = limit {
            reversed.truncate(limit);
        }
        reversed
    }

    pub fn get_all_delegations(&self, id: u64) -> Option<(Vec<SessionDelegation>, Vec<SessionDelegation>)> {
        let sessions = self.sessions.read();
        let session = sessions.get(&id)?;
        Some((session.active_delegations.clone(), session.completed_delegations.clone()))
    }

    /// Recursively sums this session and every descendant's metrics.
    /// `avg_quality` averages only non-zero quality scores across included sessions.
    pub fn get_rollup_metrics(&self, id: u64) -> Option<RollupMetrics> {
        let sessions = self.sessions.read();
        let root = sessions.get(&id)?;
        let mut total_tokens = root.metrics.tokens;
        let mut total_cost = root.metrics.cost;
        let mut quality_sum = 0.0;
        let mut quality_count = 0usize;
        if root.metrics.quality_score != 0.0 {
            quality_sum += root.metrics.quality_score;
            quality_count += 1;
        }
        let mut agent_count = 1u64;

        let mut stack = root.hierarchy_info.child_session_ids.clone();
        while let Some(child_id) = stack.pop() {
            if let Some(child) = sessions.get(&child_id) {
                total_tokens += child.metrics.tokens;
                total_cost += child.metrics.cost;
                if child.metrics.quality_score != 0.0 {
                    quality_sum += child.metrics.quality_score;
                    quality_count += 1;
                }
                agent_count += 1;
                stack.extend(child.hierarchy_info.child_session_ids.iter().copied());
            }
        }

        Some(RollupMetrics {
            total_tokens,
            total_cost,
            avg_quality: if quality_count == 0 { 0.0 } else { quality_sum / quality_count as f64 },
            total_agent_count: agent_count,
            child_session_count: root.hierarchy_info.child_session_ids.len() as u64,
        })
    }

    /// Emits `session:rollupUpdated` up the ancestor chain. Computation
    /// stays lazy in `get_rollup_metrics`; this is notification only.
    pub fn propagate_metric_update(&self, source_id: u64, metric_type: &str, _value: f64) {
        let mut cursor = self.get(source_id).and_then(|s| s.hierarchy_info.parent_session_id);
        while let Some(parent_id) = cursor {
            self.emit(Event::Session(SessionEvent::RollupUpdated {
                session_id: parent_id,
                source_session_id: source_id,
                metric_type: metric_type.to_string(),
            }));
            cursor = self.get(parent_id).and_then(|s| s.hierarchy_info.parent_session_id);
        }
    }

    pub fn get_root_sessions(&self) -> Vec<Session> {
        self.sessions.read().values().filter(|s| s.hierarchy_info.is_root).cloned().collect()
    }

    pub fn get_parent_session(&self, id: u64) -> Option<Session> {
        let parent_id = self.get(id)?.hierarchy_info.parent_session_id?;
        self.get(parent_id)
    }

    pub fn get_child_sessions(&self, id: u64) -> Vec<Session> {
        let sessions = self.sessions.read();
        sessions
            .get(&id)
            .map(|s| s.hierarchy_info.child_session_ids.iter().filter_map(|c| sessions.get(c).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn get_descendants(&self, id: u64) -> Vec<Session> {
        let sessions = self.sessions.read();
        let mut out = Vec::new();
        let mut stack: Vec<u64> = sessions.get(&id).map(|s| s.hierarchy_info.child_session_ids.clone()).unwrap_or_default();
        while let Some(child_id) = stack.pop() {
            if let Some(session) = sessions.get(&child_id) {
                stack.extend(session.hierarchy_info.child_session_ids.iter().copied());
                out.push(session.clone());
            }
        }
        out
    }

    pub fn get_summary(&self) -> SessionSummary {
        let sessions = self.sessions.read();
        let mut active = 0;
        let mut idle = 0;
        let mut ended = 0;
        for s in sessions.values() {
            match s.status {
                SessionStatus::Active => active += 1,
                SessionStatus::Idle => idle += 1,
                SessionStatus::Ended => ended += 1,
            }
        }
        SessionSummary { total: sessions.len(), active, idle, ended }
    }

    pub fn get_summary_with_hierarchy(&self) -> SummaryWithHierarchy {
        let sessions = self.sessions.read();
        let roots: Vec<&Session> = sessions.values().filter(|s| s.hierarchy_info.is_root).collect();
        let with_children = sessions.values().filter(|s| !s.hierarchy_info.child_session_ids.is_empty()).count();
        let root_sessions = roots
            .iter()
            .map(|s| RootSessionSummary { id: s.id, child_count: s.hierarchy_info.child_session_ids.len() })
            .collect();
        drop(sessions);
        SummaryWithHierarchy {
            summary: self.get_summary(),
            hierarchy_metrics: HierarchyMetrics { root_session_count: roots.len(), sessions_with_children: with_children },
            root_sessions,
        }
    }

    /// Removes ended sessions whose last update precedes `now - stale_timeout`.
    pub fn cleanup_stale(&self, stale_timeout: std::time::Duration) -> Vec<u64> {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let stale: Vec<u64> = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Ended)
            .filter(|s| (now - s.updated_at).to_std().unwrap_or(std::time::Duration::ZERO) >= stale_timeout)
            .map(|s| s.id)
            .collect();
        for id in &stale {
            sessions.remove(id);
        }
        stale
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
            && !matches!(err, EmitterError::Closed)
        {
            tracing::warn!(error = %err, "failed to emit session event");
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &SessionRegistry, project: &str, parent: Option<u64>) -> u64 {
        registry.register(RegisterSession { project: project.to_string(), parent_session_id: parent, ..Default::default() })
    }

    #[test]
    fn register_child_links_parent_atomically() {
        let registry = SessionRegistry::new();
        let parent = register(&registry, "root", None);
        let child = register(&registry, "child", Some(parent));

        let parent_session = registry.get(parent).unwrap();
        assert_eq!(parent_session.hierarchy_info.child_session_ids, vec![child]);
        assert_eq!(parent_session.rollup_metrics.child_session_count, 1);
    }

    #[test]
    fn rollup_metrics_sum_descendants() {
        let registry = SessionRegistry::new();
        let parent = registry.register(RegisterSession { project: "p".to_string(), tokens: 10.0, cost: 1.0, quality_score: 0.8, ..Default::default() });
        let child = registry.register(RegisterSession { project: "c".to_string(), parent_session_id: Some(parent), tokens: 5.0, cost: 0.5, quality_score: 0.6, ..Default::default() });
        registry.register(RegisterSession { project: "gc".to_string(), parent_session_id: Some(child), tokens: 2.0, cost: 0.1, quality_score: 0.0, ..Default::default() });

        let rollup = registry.get_rollup_metrics(parent).unwrap();
        assert_eq!(rollup.total_tokens, 17.0);
        assert_eq!(rollup.total_agent_count, 3);
        assert!((rollup.avg_quality - 0.7).abs() < 1e-9);
    }

    #[test]
    fn completed_delegation_pruned_fifo_to_fifty() {
        let registry = SessionRegistry::new();
        let id = register(&registry, "p", None);
        for i in 0..60 {
            let d = registry.add_delegation(id, serde_json::json!({"i": i})).unwrap();
            registry.update_delegation(id, &d.id, DelegationStatus::Completed).unwrap();
        }
        let completed = registry.get_completed_delegations(id, None);
        assert_eq!(completed.len(), 50);
    }

    #[test]
    fn update_preserves_hierarchy_and_session_type() {
        let registry = SessionRegistry::new();
        let parent = register(&registry, "p", None);
        let child = register(&registry, "c", Some(parent));
        registry.update(child, |s| {
            s.session_type = "autonomous".to_string();
            s.hierarchy_info.parent_session_id = None;
        });
        let updated = registry.get(child).unwrap();
        assert_eq!(updated.session_type, "cli");
        assert_eq!(updated.hierarchy_info.parent_session_id, Some(parent));
    }

    #[test]
    fn deregister_sets_ended_status() {
        let registry = SessionRegistry::new();
        let id = register(&registry, "p", None);
        let session = registry.deregister(id).unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
    }
}
