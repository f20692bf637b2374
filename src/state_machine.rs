//! Per-agent lifecycle FSM with optimistic concurrency and atomic family
//! transitions (spec §4.F).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

use crate::event_bus::{EmitterError, Event, EventEmitter, StateMachineEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    Idle,
    Initializing,
    Active,
    Delegating,
    Waiting,
    Completing,
    Completed,
    Failed,
    Terminated,
}

impl AgentState {
    pub const ALL: [AgentState; 9] = [
        AgentState::Idle,
        AgentState::Initializing,
        AgentState::Active,
        AgentState::Delegating,
        AgentState::Waiting,
        AgentState::Completing,
        AgentState::Completed,
        AgentState::Failed,
        AgentState::Terminated,
    ];

    /// The static transition table from spec §4.F.
    pub fn allowed_transitions(&self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Idle => &[Initializing, Terminated],
            Initializing => &[Active, Failed, Terminated],
            Active => &[Delegating, Waiting, Completing, Failed, Terminated],
            Delegating => &[Active, Waiting, Failed, Terminated],
            Waiting => &[Active, Failed, Terminated],
            Completing => &[Completed, Failed, Terminated],
            Completed => &[Terminated],
            Failed => &[Terminated],
            Terminated => &[],
        }
    }

    pub fn can_transition_to(&self, target: AgentState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_stale_eligible(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Completed | AgentState::Failed | AgentState::Terminated)
    }
}

#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum StateMachineError {
    #[error("agent {0} is already registered")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::state_machine::duplicate)))]
    AlreadyRegistered(String),
    #[error("invalid transition for {agent_id} from {from_state:?} to {to_state:?}; allowed: {allowed_transitions:?}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::state_machine::invalid_transition)))]
    InvalidTransition {
        agent_id: String,
        from_state: AgentState,
        to_state: AgentState,
        allowed_transitions: Vec<AgentState>,
    },
    #[error("optimistic lock failed for {agent_id}: expected version {expected_version}, actual {actual_version}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::state_machine::optimistic_lock)))]
    OptimisticLock { agent_id: String, expected_version: u64, actual_version: u64 },
    #[error("agent {0} not found")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::state_machine::not_found)))]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: AgentState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateEntry {
    pub agent_id: String,
    pub state: AgentState,
    pub version: u64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub history: Vec<HistoryEntry>,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub expected_version: Option<u64>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub reason: Option<String>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self { expected_version: None, metadata: None, reason: None }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateState {
    pub descendant_count: usize,
    pub state_counts: FxHashMap<AgentState, usize>,
    pub active_count: usize,
    pub has_failures: bool,
    pub is_fully_complete: bool,
}

#[derive(Debug, Clone)]
pub struct GlobalEvent {
    pub agent_id: String,
    pub event_type: String,
    pub at: DateTime<Utc>,
}

struct ManagerEvent {
    agent_id: String,
    event_type: &'static str,
    at: DateTime<Utc>,
}

pub struct HierarchicalStateMachine {
    entries: parking_lot::RwLock<FxHashMap<String, AgentStateEntry>>,
    event_log: parking_lot::RwLock<Vec<ManagerEvent>>,
    max_event_log_size: usize,
    max_history_len: usize,
    stale_timeout: Duration,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl HierarchicalStateMachine {
    pub fn new(max_event_log_size: usize, max_history_len: usize, stale_timeout: Duration) -> Self {
        Self {
            entries: parking_lot::RwLock::new(FxHashMap::default()),
            event_log: parking_lot::RwLock::new(Vec::new()),
            max_event_log_size,
            max_history_len,
            stale_timeout,
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn register(
        &self,
        agent_id: &str,
        parent_id: Option<&str>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<(), StateMachineError> {
        let mut entries = self.entries.write();
        if entries.contains_key(agent_id) {
            return Err(StateMachineError::AlreadyRegistered(agent_id.to_string()));
        }
        let now = Utc::now();
        let entry = AgentStateEntry {
            agent_id: agent_id.to_string(),
            state: AgentState::Idle,
            version: 1,
            metadata: metadata.unwrap_or_default(),
            history: vec![HistoryEntry { state: AgentState::Idle, at: now, reason: None }],
            parent_id: parent_id.map(str::to_string),
            children: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        if let Some(parent_id) = parent_id
            && let Some(parent) = entries.get_mut(parent_id)
        {
            parent.children.push(agent_id.to_string());
        }
        entries.insert(agent_id.to_string(), entry);
        drop(entries);

        self.log_event(agent_id, "registered");
        self.emit(Event::StateMachine(StateMachineEvent::Registered { agent_id: agent_id.to_string() }));
        Ok(())
    }

    pub fn get_state(&self, agent_id: &str) -> Option<AgentStateEntry> {
        self.entries.read().get(agent_id).cloned()
    }

    #[tracing::instrument(skip(self, options), fields(agent_id = %agent_id, target = ?target))]
    pub fn update_state(
        &self,
        agent_id: &str,
        target: AgentState,
        options: UpdateOptions,
    ) -> Result<AgentStateEntry, StateMachineError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(agent_id).ok_or_else(|| StateMachineError::NotFound(agent_id.to_string()))?;

        if !entry.state.can_transition_to(target) {
            return Err(StateMachineError::InvalidTransition {
                agent_id: agent_id.to_string(),
                from_state: entry.state,
                to_state: target,
                allowed_transitions: entry.state.allowed_transitions().to_vec(),
            });
        }
        if let Some(expected) = options.expected_version
            && expected != entry.version
        {
            return Err(StateMachineError::OptimisticLock {
                agent_id: agent_id.to_string(),
                expected_version: expected,
                actual_version: entry.version,
            });
        }

        let from = entry.state;
        apply_transition(entry, target, options, self.max_history_len);
        let updated = entry.clone();
        drop(entries);

        self.log_event(agent_id, "state-change");
        self.emit(Event::StateMachine(StateMachineEvent::Changed {
            agent_id: agent_id.to_string(),
            from: format!("{from:?}"),
            to: format!("{target:?}"),
            version: updated.version,
        }));
        Ok(updated)
    }

    /// Validates every target transition under the current snapshot before
    /// applying any; rejects the whole operation if any member is invalid.
    #[tracing::instrument(skip(self))]
    pub fn atomic_family_transition(
        &self,
        parent_id: &str,
        parent_target: AgentState,
        child_target: AgentState,
    ) -> Result<Vec<AgentStateEntry>, StateMachineError> {
        let mut entries = self.entries.write();
        let parent = entries.get(parent_id).ok_or_else(|| StateMachineError::NotFound(parent_id.to_string()))?;
        let members: Vec<String> = std::iter::once(parent_id.to_string()).chain(parent.children.iter().cloned()).collect();

        for member in &members {
            let is_parent = member == parent_id;
            let target = if is_parent { parent_target } else { child_target };
            let current = entries.get(member).ok_or_else(|| StateMachineError::NotFound(member.clone()))?;
            if !current.state.can_transition_to(target) {
                return Err(StateMachineError::InvalidTransition {
                    agent_id: member.clone(),
                    from_state: current.state,
                    to_state: target,
                    allowed_transitions: current.state.allowed_transitions().to_vec(),
                });
            }
        }

        let mut results = Vec::with_capacity(members.len());
        for member in &members {
            let is_parent = member == parent_id;
            let target = if is_parent { parent_target } else { child_target };
            let entry = entries.get_mut(member).expect("validated above");
            apply_transition(entry, target, UpdateOptions::default(), self.max_history_len);
            results.push(entry.clone());
        }
        drop(entries);

        self.log_event(parent_id, "atomic-family-transition");
        self.emit(Event::StateMachine(StateMachineEvent::AtomicFamilyTransition {
            parent_id: parent_id.to_string(),
            member_count: members.len(),
        }));
        Ok(results)
    }

    pub fn get_aggregate_state(&self, agent_id: &str) -> Option<AggregateState> {
        let entries = self.entries.read();
        let root = entries.get(agent_id)?;
        let mut state_counts: FxHashMap<AgentState, usize> = FxHashMap::default();
        *state_counts.entry(root.state).or_insert(0) += 1;

        let mut stack: Vec<String> = root.children.clone();
        let mut descendant_count = 0usize;
        while let Some(id) = stack.pop() {
            if let Some(node) = entries.get(&id) {
                *state_counts.entry(node.state).or_insert(0) += 1;
                stack.extend(node.children.iter().cloned());
                descendant_count += 1;
            }
        }

        let active_count = [AgentState::Active, AgentState::Delegating, AgentState::Waiting, AgentState::Initializing]
            .iter()
            .map(|s| state_counts.get(s).copied().unwrap_or(0))
            .sum();
        let has_failures = state_counts.get(&AgentState::Failed).copied().unwrap_or(0) > 0;
        let total = descendant_count + 1;
        let completed = state_counts.get(&AgentState::Completed).copied().unwrap_or(0);
        let terminated = state_counts.get(&AgentState::Terminated).copied().unwrap_or(0);
        let is_fully_complete = completed + terminated == total && !has_failures;

        Some(AggregateState { descendant_count, state_counts, active_count, has_failures, is_fully_complete })
    }

    /// Removes stale entries (idle/completed/failed/terminated past the
    /// timeout), cascading to descendants. Returns removed ids.
    pub fn cleanup_stale(&self) -> Vec<String> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let stale_roots: Vec<String> = entries
            .values()
            .filter(|e| e.state.is_stale_eligible())
            .filter(|e| (now - e.updated_at).to_std().unwrap_or(Duration::ZERO) >= self.stale_timeout)
            .map(|e| e.agent_id.clone())
            .collect();

        let mut removed = Vec::new();
        let mut stack = stale_roots;
        while let Some(id) = stack.pop() {
            if let Some(entry) = entries.remove(&id) {
                stack.extend(entry.children.iter().cloned());
                removed.push(id);
            }
        }
        removed
    }

    pub fn get_event_log(&self, agent_id: &str) -> Vec<GlobalEvent> {
        self.event_log
            .read()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .map(|e| GlobalEvent { agent_id: e.agent_id.clone(), event_type: e.event_type.to_string(), at: e.at })
            .collect()
    }

    pub fn get_all_events(&self, since: Option<DateTime<Utc>>, event_type: Option<&str>) -> Vec<GlobalEvent> {
        self.event_log
            .read()
            .iter()
            .filter(|e| since.is_none_or(|since| e.at >= since))
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .map(|e| GlobalEvent { agent_id: e.agent_id.clone(), event_type: e.event_type.to_string(), at: e.at })
            .collect()
    }

    fn log_event(&self, agent_id: &str, event_type: &'static str) {
        let mut log = self.event_log.write();
        if log.len() == self.max_event_log_size {
            log.remove(0);
        }
        log.push(ManagerEvent { agent_id: agent_id.to_string(), event_type, at: Utc::now() });
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
            && !matches!(err, EmitterError::Closed)
        {
            tracing::warn!(error = %err, "failed to emit state-machine event");
        }
    }
}

fn apply_transition(entry: &mut AgentStateEntry, target: AgentState, options: UpdateOptions, max_history_len: usize) {
    entry.state = target;
    entry.version += 1;
    entry.updated_at = Utc::now();
    if let Some(metadata) = options.metadata {
        for (k, v) in metadata {
            entry.metadata.insert(k, v);
        }
    }
    entry.history.push(HistoryEntry { state: target, at: entry.updated_at, reason: options.reason });
    if entry.history.len() > max_history_len {
        let overflow = entry.history.len() - max_history_len;
        entry.history.drain(0..overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> HierarchicalStateMachine {
        HierarchicalStateMachine::new(1024, 256, Duration::from_secs(60))
    }

    #[test]
    fn register_starts_idle_version_one() {
        let m = machine();
        m.register("a", None, None).unwrap();
        let entry = m.get_state("a").unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.history.len(), 1);
        assert_eq!(entry.history[0].state, AgentState::Idle);
    }

    #[test]
    fn update_state_increments_version_by_one() {
        let m = machine();
        m.register("a", None, None).unwrap();
        let updated = m.update_state("a", AgentState::Initializing, UpdateOptions::default()).unwrap();
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn invalid_transition_rejected() {
        let m = machine();
        m.register("a", None, None).unwrap();
        let err = m.update_state("a", AgentState::Completed, UpdateOptions::default()).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
    }

    #[test]
    fn terminated_has_no_outgoing_transitions() {
        assert!(AgentState::Terminated.allowed_transitions().is_empty());
    }

    #[test]
    fn optimistic_lock_rejects_stale_version() {
        let m = machine();
        m.register("a", None, None).unwrap();
        let opts = UpdateOptions { expected_version: Some(99), ..Default::default() };
        let err = m.update_state("a", AgentState::Initializing, opts).unwrap_err();
        assert!(matches!(err, StateMachineError::OptimisticLock { .. }));
    }

    #[test]
    fn atomic_family_transition_rejected_rolls_back_nothing() {
        let m = machine();
        m.register("p", None, None).unwrap();
        m.register("c1", Some("p"), None).unwrap();
        m.register("c2", Some("p"), None).unwrap();

        let err = m.atomic_family_transition("p", AgentState::Completed, AgentState::Completed).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));

        assert_eq!(m.get_state("p").unwrap().version, 1);
        assert_eq!(m.get_state("c1").unwrap().version, 1);
        assert_eq!(m.get_state("c2").unwrap().version, 1);
        assert_eq!(m.get_state("p").unwrap().state, AgentState::Idle);
    }

    #[test]
    fn atomic_family_transition_applies_all_on_success() {
        let m = machine();
        m.register("p", None, None).unwrap();
        m.register("c1", Some("p"), None).unwrap();
        m.atomic_family_transition("p", AgentState::Initializing, AgentState::Initializing).unwrap();
        assert_eq!(m.get_state("p").unwrap().state, AgentState::Initializing);
        assert_eq!(m.get_state("c1").unwrap().state, AgentState::Initializing);
    }

    #[test]
    fn aggregate_state_counts_descendants() {
        let m = machine();
        m.register("p", None, None).unwrap();
        m.register("c1", Some("p"), None).unwrap();
        m.register("c2", Some("p"), None).unwrap();
        m.update_state("c1", AgentState::Initializing, UpdateOptions::default()).unwrap();
        m.update_state("c1", AgentState::Active, UpdateOptions::default()).unwrap();

        let agg = m.get_aggregate_state("p").unwrap();
        assert_eq!(agg.descendant_count, 2);
        assert_eq!(agg.active_count, 1);
        assert!(!agg.has_failures);
    }

    #[test]
    fn cleanup_stale_cascades_to_descendants() {
        let m = HierarchicalStateMachine::new(1024, 256, Duration::ZERO);
        m.register("p", None, None).unwrap();
        m.register("c1", Some("p"), None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let removed = m.cleanup_stale();
        assert!(removed.contains(&"p".to_string()));
        assert!(removed.contains(&"c1".to_string()));
    }
}
