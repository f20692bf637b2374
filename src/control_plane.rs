//! Composition root wiring every service into the data flow spec §2
//! describes: an external orchestrator asks the Delegation Decider whether
//! to delegate; it consults the Complexity Analyzer and the Hierarchy
//! Registry/State Machine for capacity, then the Task Manager, Session
//! Registry, and Coordination DB record the outcome.

use std::sync::Arc;

use crate::coordination_db::CoordinationDb;
use crate::dashboard::DashboardManager;
use crate::delegation::{AgentCapability, DelegationDecider};
use crate::event_bus::EventHub;
use crate::feature_flags::FeatureFlags;
use crate::hierarchy::{HierarchyError, HierarchyRegistry};
use crate::complexity::ComplexityAnalyzer;
use crate::hook_metrics::HookMetrics;
use crate::plan_evaluator::PlanEvaluator;
use crate::rate_limit::RateLimitTracker;
use crate::session_registry::SessionRegistry;
use crate::state_machine::HierarchicalStateMachine;
use crate::task_manager::{Task, TaskManager};
use crate::config::ControlPlaneConfig;

/// Owns one instance of every core service, sharing a single [`EventHub`] so
/// a listener subscribes once and observes all of them (spec §9).
pub struct ControlPlane {
    pub config: ControlPlaneConfig,
    pub hub: Arc<EventHub>,
    pub feature_flags: Arc<FeatureFlags>,
    pub hook_metrics: Arc<HookMetrics>,
    pub rate_limit: Arc<RateLimitTracker>,
    pub coordination_db: Arc<CoordinationDb>,
    pub hierarchy: Arc<HierarchyRegistry>,
    pub state_machine: Arc<HierarchicalStateMachine>,
    pub session_registry: Arc<SessionRegistry>,
    pub complexity: Arc<ComplexityAnalyzer>,
    pub delegation: Arc<DelegationDecider>,
    pub task_manager: Arc<TaskManager>,
    pub plan_evaluator: Arc<PlanEvaluator>,
    pub dashboard: Arc<DashboardManager>,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig) -> Self {
        let hub = EventHub::new(4096);
        let emitter: Arc<dyn crate::event_bus::EventEmitter> = Arc::new(hub.emitter());

        let complexity = Arc::new(ComplexityAnalyzer::new().with_emitter(emitter.clone()));

        Self {
            feature_flags: Arc::new(FeatureFlags::new(Vec::<String>::new()).with_emitter(emitter.clone())),
            hook_metrics: Arc::new(HookMetrics::new()),
            rate_limit: Arc::new(
                RateLimitTracker::new(config.rate_limit.plan.clone()).with_emitter(emitter.clone()),
            ),
            coordination_db: Arc::new(
                CoordinationDb::new(config.coordination_db.default_lock_ttl, config.coordination_db.stale_session_threshold)
                    .with_emitter(emitter.clone()),
            ),
            hierarchy: Arc::new(HierarchyRegistry::new(config.hierarchy).with_emitter(emitter.clone())),
            state_machine: Arc::new(
                HierarchicalStateMachine::new(
                    config.state_machine.max_event_log_size,
                    config.state_machine.max_history_len,
                    config.state_machine.stale_timeout,
                )
                .with_emitter(emitter.clone()),
            ),
            session_registry: Arc::new(SessionRegistry::new().with_emitter(emitter.clone())),
            delegation: Arc::new(DelegationDecider::new(complexity.clone()).with_emitter(emitter.clone())),
            complexity,
            task_manager: Arc::new(TaskManager::new().with_emitter(emitter.clone())),
            plan_evaluator: Arc::new(PlanEvaluator::new().with_emitter(emitter.clone())),
            dashboard: Arc::new(DashboardManager::new(config.dashboard.update_interval).with_emitter(emitter)),
            config,
            hub,
        }
    }

    /// Reserves hierarchy slots and transitions a freshly spawned child agent
    /// through `IDLE -> INITIALIZING`, the first half of spec §2's "if
    /// delegating" sequence. The caller still owns creating the subtask and
    /// child session; this only touches the two structures that gate depth
    /// and fan-out.
    pub fn spawn_child_agent(&self, parent_agent_id: &str, child_agent_id: &str) -> Result<(), HierarchyError> {
        self.hierarchy.register_hierarchy(Some(parent_agent_id), child_agent_id, None)?;
        if self.state_machine.get_state(child_agent_id).is_none() {
            let _ = self.state_machine.register(child_agent_id, None, None);
        }
        let _ = self.state_machine.update_state(
            child_agent_id,
            crate::state_machine::AgentState::Initializing,
            crate::state_machine::UpdateOptions::default(),
        );
        Ok(())
    }

    /// Asks the Delegation Decider whether `task` should be split, consulting
    /// the Hierarchy Registry for the agent's remaining depth the way spec §2
    /// describes ("I consults H for complexity and E/F for depth/fan-out").
    pub fn evaluate_delegation(&self, task: &Task, agent_id: &str, mut agent: AgentCapability) -> crate::delegation::DelegationDecision {
        if let Some(node) = self.hierarchy.get_node(agent_id) {
            agent.hierarchy_depth = node.depth;
        }
        self.delegation.decide(task, &agent, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_manager::CreateTaskProps;

    #[test]
    fn facade_wires_every_service_with_a_shared_hub() {
        let plane = ControlPlane::new(ControlPlaneConfig::default());
        let task = plane.task_manager.create_task(CreateTaskProps {
            title: "Fix typo".to_string(),
            description: "Fix typo in README".to_string(),
            phase: "implementation".to_string(),
            estimate: Some("5m".to_string()),
            ..Default::default()
        });
        let decision = plane.evaluate_delegation(&task, "agent-1", AgentCapability::default());
        assert!(!decision.should_delegate);
    }

    #[test]
    fn spawn_child_agent_reserves_hierarchy_and_initializes_state() {
        let plane = ControlPlane::new(ControlPlaneConfig::default());
        plane.hierarchy.register_hierarchy(None, "root", None).unwrap();
        let _ = plane.state_machine.register("root", None, None);
        plane.spawn_child_agent("root", "child-1").unwrap();
        assert_eq!(plane.hierarchy.get_node("child-1").unwrap().depth, 1);
        assert_eq!(plane.state_machine.get_state("child-1").unwrap().state, crate::state_machine::AgentState::Initializing);
    }
}
