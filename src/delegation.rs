//! Scores a task against an agent's capacity and suggests whether and how
//! to delegate it (spec §4.I).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::complexity::{ComplexityAnalyzer, Strategy};
use crate::event_bus::{DelegationEvent, EmitterError, Event, EventEmitter};
use crate::task_manager::Task;

const PARALLEL_INDICATORS: &[&str] = &["in parallel", "simultaneously", "concurrently", "independent"];
const SEQUENTIAL_INDICATORS: &[&str] = &["step by step", "first", "then", "pipeline", "sequentially"];
const DEBATE_INDICATORS: &[&str] = &["debate", "disagree", "tradeoff", "trade-off", "compare approaches"];
const REVIEW_INDICATORS: &[&str] = &["review", "audit", "critique", "second opinion"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationPattern {
    Parallel,
    Sequential,
    Debate,
    Review,
    Ensemble,
    Direct,
}

#[derive(Debug, Clone, Copy)]
pub struct DelegationWeights {
    pub complexity: f64,
    pub subtask_count: f64,
    pub agent_confidence: f64,
    pub agent_load: f64,
    pub context_utilization: f64,
    pub depth_remaining: f64,
}

impl Default for DelegationWeights {
    fn default() -> Self {
        Self {
            complexity: 0.3,
            subtask_count: 0.15,
            agent_confidence: 0.2,
            agent_load: 0.15,
            context_utilization: 0.1,
            depth_remaining: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DelegationConfig {
    pub weights: DelegationWeights,
    pub min_delegation_score: f64,
    pub max_depth: u32,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self { weights: DelegationWeights::default(), min_delegation_score: 0.55, max_depth: 5 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartialDelegationConfig {
    pub weights: Option<DelegationWeights>,
    pub min_delegation_score: Option<f64>,
    pub max_depth: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AgentCapability {
    pub confidence: Option<f64>,
    pub required_capability_match: Option<f64>,
    pub phase_matches: bool,
    pub queue_depth: Option<u32>,
    pub max_queue_depth: Option<u32>,
    pub child_agent_count: Option<u32>,
    pub max_children: Option<u32>,
    pub context_used_fraction: f64,
    pub hierarchy_depth: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DelegationFactors {
    pub complexity: f64,
    pub subtask_count: f64,
    pub agent_confidence: f64,
    pub agent_load: f64,
    pub context_utilization: f64,
    pub depth_remaining: f64,
}

#[derive(Debug, Clone)]
pub struct DelegationDecision {
    pub should_delegate: bool,
    pub confidence: f64,
    pub score: f64,
    pub factors: DelegationFactors,
    pub suggested_pattern: DelegationPattern,
    pub reasoning: String,
    pub hints: Vec<String>,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DelegationMetrics {
    pub decisions_count: u64,
    pub delegations_recommended: u64,
    pub direct_executions_recommended: u64,
    pub pattern_distribution: FxHashMap<String, u64>,
}

pub struct DelegationDecider {
    config: RwLock<DelegationConfig>,
    complexity: Arc<ComplexityAnalyzer>,
    cache: RwLock<FxHashMap<String, DelegationDecision>>,
    metrics: RwLock<DelegationMetrics>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl DelegationDecider {
    pub fn new(complexity: Arc<ComplexityAnalyzer>) -> Self {
        Self {
            config: RwLock::new(DelegationConfig::default()),
            complexity,
            cache: RwLock::new(FxHashMap::default()),
            metrics: RwLock::new(DelegationMetrics::default()),
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn update_config(&self, partial: PartialDelegationConfig) {
        let mut config = self.config.write();
        if let Some(weights) = partial.weights {
            config.weights = weights;
        }
        if let Some(score) = partial.min_delegation_score {
            config.min_delegation_score = score;
        }
        if let Some(depth) = partial.max_depth {
            config.max_depth = depth;
        }
        drop(config);
        self.cache.write().clear();
    }

    #[tracing::instrument(skip(self, task, agent), fields(task_id = %task.id))]
    pub fn decide(&self, task: &Task, agent: &AgentCapability, skip_cache: bool) -> DelegationDecision {
        if !skip_cache
            && let Some(cached) = self.cache.read().get(&task.id)
        {
            return cached.clone();
        }

        let config = *self.config.read();
        let depth_remaining = config.max_depth.saturating_sub(agent.hierarchy_depth);
        let subtask_count = subtask_count_for(task);

        if depth_remaining == 0 || subtask_count < 2 || !task.child_task_ids.is_empty() {
            let decision = self.direct_decision(task, "hard gate triggered (depth, subtask count, or already decomposed)");
            self.record(&decision);
            return decision;
        }

        let complexity_result = self.complexity.analyze(task, agent.hierarchy_depth as usize, !skip_cache);
        let complexity = complexity_result.score / 100.0;

        let agent_confidence = agent_confidence(agent, task);
        let agent_load = agent_load(agent);
        let context_utilization = agent.context_used_fraction.clamp(0.0, 1.0);
        let depth_remaining_norm = (depth_remaining as f64 / config.max_depth.max(1) as f64).clamp(0.0, 1.0);

        let factors = DelegationFactors {
            complexity,
            subtask_count: (subtask_count as f64 / 10.0).min(1.0),
            agent_confidence,
            agent_load,
            context_utilization,
            depth_remaining: depth_remaining_norm,
        };

        let score = factors.complexity * config.weights.complexity
            + factors.subtask_count * config.weights.subtask_count
            + factors.agent_confidence * config.weights.agent_confidence
            + (1.0 - factors.agent_load) * config.weights.agent_load
            + (1.0 - factors.context_utilization) * config.weights.context_utilization
            + factors.depth_remaining * config.weights.depth_remaining;

        let should_delegate = score >= config.min_delegation_score;
        let suggested_pattern = if should_delegate {
            select_pattern(task, complexity_result.strategy)
        } else {
            DelegationPattern::Direct
        };

        let reasoning = if should_delegate {
            format!("score {score:.2} meets threshold {:.2}; suggested pattern {:?}", config.min_delegation_score, suggested_pattern)
        } else {
            format!("score {score:.2} below threshold {:.2}", config.min_delegation_score)
        };

        let mut hints = Vec::new();
        if factors.agent_load > 0.8 {
            hints.push("agent queue is nearly saturated".to_string());
        }
        if factors.context_utilization > 0.8 {
            hints.push("agent context window is nearly exhausted".to_string());
        }

        let decision = DelegationDecision {
            should_delegate,
            confidence: factors.agent_confidence,
            score,
            factors,
            suggested_pattern,
            reasoning,
            hints,
            task_id: task.id.clone(),
            timestamp: Utc::now(),
        };

        self.cache.write().insert(task.id.clone(), decision.clone());
        self.record(&decision);
        decision
    }

    pub fn evaluate_batch(&self, tasks: &[Task], agent: &AgentCapability) -> Vec<DelegationDecision> {
        tasks.iter().map(|t| self.decide(t, agent, false)).collect()
    }

    pub fn metrics(&self) -> DelegationMetrics {
        self.metrics.read().clone()
    }

    fn direct_decision(&self, task: &Task, reason: &str) -> DelegationDecision {
        DelegationDecision {
            should_delegate: false,
            confidence: 0.0,
            score: 0.0,
            factors: DelegationFactors {
                complexity: 0.0,
                subtask_count: 0.0,
                agent_confidence: 0.0,
                agent_load: 0.0,
                context_utilization: 0.0,
                depth_remaining: 0.0,
            },
            suggested_pattern: DelegationPattern::Direct,
            reasoning: reason.to_string(),
            hints: Vec::new(),
            task_id: task.id.clone(),
            timestamp: Utc::now(),
        }
    }

    fn record(&self, decision: &DelegationDecision) {
        let mut metrics = self.metrics.write();
        metrics.decisions_count += 1;
        if decision.should_delegate {
            metrics.delegations_recommended += 1;
        } else {
            metrics.direct_executions_recommended += 1;
        }
        *metrics.pattern_distribution.entry(format!("{:?}", decision.suggested_pattern)).or_insert(0) += 1;
        drop(metrics);

        self.emit(Event::Delegation(DelegationEvent::Decided {
            task_id: decision.task_id.clone(),
            should_delegate: decision.should_delegate,
            pattern: format!("{:?}", decision.suggested_pattern),
        }));
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
            && !matches!(err, EmitterError::Closed)
        {
            tracing::warn!(error = %err, "failed to emit delegation event");
        }
    }
}

fn subtask_count_for(task: &Task) -> usize {
    let acceptance = task.acceptance_criteria.len();
    let listed = task
        .description
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with('-') || trimmed.starts_with('*') || trimmed.chars().next().is_some_and(|c| c.is_ascii_digit())
        })
        .count();
    (acceptance + listed).min(20)
}

fn agent_confidence(agent: &AgentCapability, task: &Task) -> f64 {
    if let Some(confidence) = agent.confidence {
        return confidence.clamp(0.0, 1.0);
    }
    if let Some(match_fraction) = agent.required_capability_match {
        return match_fraction.clamp(0.0, 1.0);
    }
    if agent.phase_matches {
        return 0.7;
    }
    let _ = task;
    0.5
}

fn agent_load(agent: &AgentCapability) -> f64 {
    if let (Some(depth), Some(max)) = (agent.queue_depth, agent.max_queue_depth)
        && max > 0
    {
        return (depth as f64 / max as f64).clamp(0.0, 1.0);
    }
    if let (Some(children), Some(max)) = (agent.child_agent_count, agent.max_children)
        && max > 0
    {
        return (children as f64 / max as f64).clamp(0.0, 1.0);
    }
    0.0
}

fn select_pattern(task: &Task, strategy: Strategy) -> DelegationPattern {
    let haystack = format!("{} {}", task.title, task.description).to_lowercase();
    if PARALLEL_INDICATORS.iter().any(|kw| haystack.contains(kw)) {
        return DelegationPattern::Parallel;
    }
    if DEBATE_INDICATORS.iter().any(|kw| haystack.contains(kw)) {
        return DelegationPattern::Debate;
    }
    if REVIEW_INDICATORS.iter().any(|kw| haystack.contains(kw)) {
        return DelegationPattern::Review;
    }
    if SEQUENTIAL_INDICATORS.iter().any(|kw| haystack.contains(kw)) {
        return DelegationPattern::Sequential;
    }
    match strategy {
        Strategy::Competitive => DelegationPattern::Ensemble,
        _ => DelegationPattern::Parallel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_manager::TaskManager;

    fn decider() -> DelegationDecider {
        DelegationDecider::new(Arc::new(ComplexityAnalyzer::new()))
    }

    fn task_with_criteria(n: usize) -> Task {
        let mut task = TaskManager::blank_task("t1", "Build the ingestion pipeline", "Implement the pipeline in parallel stages");
        task.acceptance_criteria = (0..n).map(|i| format!("criterion {i}")).collect();
        task
    }

    #[test]
    fn depth_exhausted_forces_direct() {
        let decider = decider();
        let task = task_with_criteria(3);
        let agent = AgentCapability { hierarchy_depth: 5, ..Default::default() };
        let decision = decider.decide(&task, &agent, true);
        assert!(!decision.should_delegate);
        assert_eq!(decision.suggested_pattern, DelegationPattern::Direct);
    }

    #[test]
    fn fewer_than_two_subtasks_forces_direct() {
        let decider = decider();
        let task = task_with_criteria(1);
        let agent = AgentCapability::default();
        let decision = decider.decide(&task, &agent, true);
        assert!(!decision.should_delegate);
    }

    #[test]
    fn already_decomposed_task_forces_direct() {
        let decider = decider();
        let mut task = task_with_criteria(3);
        task.child_task_ids.push("child-1".to_string());
        let decision = decider.decide(&task, &AgentCapability::default(), true);
        assert!(!decision.should_delegate);
    }

    #[test]
    fn confident_agent_with_capacity_is_offered_delegation() {
        let decider = decider();
        let task = task_with_criteria(4);
        let agent = AgentCapability { confidence: Some(0.9), hierarchy_depth: 0, ..Default::default() };
        let decision = decider.decide(&task, &agent, true);
        assert!(decision.score > 0.0);
    }

    #[test]
    fn parallel_keyword_selects_parallel_pattern_when_delegating() {
        let decider = decider();
        decider.update_config(PartialDelegationConfig { min_delegation_score: Some(0.0), ..Default::default() });
        let task = task_with_criteria(4);
        let agent = AgentCapability { confidence: Some(0.9), ..Default::default() };
        let decision = decider.decide(&task, &agent, true);
        assert!(decision.should_delegate);
        assert_eq!(decision.suggested_pattern, DelegationPattern::Parallel);
    }

    #[test]
    fn batch_evaluates_each_task() {
        let decider = decider();
        let tasks = vec![task_with_criteria(3), task_with_criteria(4)];
        let results = decider.evaluate_batch(&tasks, &AgentCapability::default());
        assert_eq!(results.len(), 2);
        assert_eq!(decider.metrics().decisions_count, 2);
    }
}
