//! Weighted complexity scoring over a task, producing a suggested execution
//! strategy (spec §4.H).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::event_bus::{EmitterError, ComplexityEvent, Event, EventEmitter};
use crate::task_manager::Task;

const SECURITY_KEYWORDS: &[&str] = &["auth", "security", "encrypt", "credential", "token", "vulnerability", "permission"];
const ARCHITECTURE_KEYWORDS: &[&str] = &["architecture", "refactor", "migrate", "redesign", "schema", "interface"];
const PERFORMANCE_KEYWORDS: &[&str] = &["performance", "optimize", "latency", "throughput", "scale", "benchmark"];

#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub dependency_depth: f64,
    pub acceptance_criteria: f64,
    pub effort_estimate: f64,
    pub technical_keywords: f64,
    pub historical_success: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self { dependency_depth: 0.25, acceptance_criteria: 0.2, effort_estimate: 0.2, technical_keywords: 0.2, historical_success: 0.15 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    FastPath,
    Standard,
    Competitive,
}

#[derive(Debug, Clone, Copy)]
pub struct StrategyThresholds {
    pub fast_path: f64,
    pub standard: f64,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self { fast_path: 30.0, standard: 65.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub dependency_depth: f64,
    pub acceptance_criteria: f64,
    pub effort_estimate: f64,
    pub technical_keywords: f64,
    pub historical_success: f64,
}

#[derive(Debug, Clone)]
pub struct ComplexityResult {
    pub task_id: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub strategy: Strategy,
    pub analyzed_at: DateTime<Utc>,
}

/// Optional historical-success collaborator (spec's "memory store").
pub trait PatternSuccessSource: Send + Sync {
    fn get_task_pattern_success(&self, signature: &str) -> Option<(f64, u32)>;
}

pub struct ComplexityAnalyzer {
    weights: Weights,
    thresholds: StrategyThresholds,
    memory: Option<Arc<dyn PatternSuccessSource>>,
    cache: RwLock<FxHashMap<String, ComplexityResult>>,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self {
            weights: Weights::default(),
            thresholds: StrategyThresholds::default(),
            memory: None,
            cache: RwLock::new(FxHashMap::default()),
            emitter: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn PatternSuccessSource>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn analyze(&self, task: &Task, ancestor_depth: usize, use_cache: bool) -> ComplexityResult {
        if use_cache
            && let Some(cached) = self.cache.read().get(&task.id)
        {
            return cached.clone();
        }

        let dependency_depth = self.score_dependency_depth(task, ancestor_depth);
        let acceptance_criteria = self.score_acceptance_criteria(task);
        let effort_estimate = self.score_effort_estimate(task);
        let technical_keywords = self.score_keywords(task);
        let historical_success = self.score_historical_success(task);

        let score = dependency_depth * self.weights.dependency_depth
            + acceptance_criteria * self.weights.acceptance_criteria
            + effort_estimate * self.weights.effort_estimate
            + technical_keywords * self.weights.technical_keywords
            + historical_success * self.weights.historical_success;

        let strategy = if score < self.thresholds.fast_path {
            Strategy::FastPath
        } else if score < self.thresholds.standard {
            Strategy::Standard
        } else {
            Strategy::Competitive
        };

        let result = ComplexityResult {
            task_id: task.id.clone(),
            score,
            breakdown: ScoreBreakdown { dependency_depth, acceptance_criteria, effort_estimate, technical_keywords, historical_success },
            strategy,
            analyzed_at: Utc::now(),
        };

        self.cache.write().insert(task.id.clone(), result.clone());
        self.emit(Event::Complexity(ComplexityEvent::Analyzed {
            task_id: task.id.clone(),
            score: result.score,
            strategy: format!("{:?}", result.strategy),
        }));
        result
    }

    pub fn analyze_batch(&self, tasks: &[Task]) -> Vec<ComplexityResult> {
        tasks.iter().map(|t| self.analyze(t, 0, true)).collect()
    }

    fn score_dependency_depth(&self, task: &Task, ancestor_depth: usize) -> f64 {
        let dep_count = task.requires.len() + task.blocks.len();
        if dep_count == 0 && ancestor_depth == 0 {
            return 0.0;
        }
        let raw = dep_count as f64 * 8.0 + ancestor_depth as f64 * 10.0;
        raw.min(100.0)
    }

    fn score_acceptance_criteria(&self, task: &Task) -> f64 {
        if task.acceptance_criteria.is_empty() {
            return 10.0;
        }
        let count = task.acceptance_criteria.len() as f64;
        (10.0 + count * 12.0).min(100.0)
    }

    fn score_effort_estimate(&self, task: &Task) -> f64 {
        let Some(estimate) = &task.estimate else { return 50.0 };
        parse_effort_score(estimate).unwrap_or(50.0)
    }

    fn score_keywords(&self, task: &Task) -> f64 {
        let haystack = format!("{} {}", task.title, task.description).to_lowercase();
        let mut score = 0.0;
        for kw in SECURITY_KEYWORDS {
            if haystack.contains(kw) {
                score += 12.0;
            }
        }
        for kw in ARCHITECTURE_KEYWORDS {
            if haystack.contains(kw) {
                score += 10.0;
            }
        }
        for kw in PERFORMANCE_KEYWORDS {
            if haystack.contains(kw) {
                score += 8.0;
            }
        }
        score.min(100.0)
    }

    fn score_historical_success(&self, task: &Task) -> f64 {
        let Some(memory) = &self.memory else { return 50.0 };
        let signature = format!("{}:{}", task.phase, task.title);
        match memory.get_task_pattern_success(&signature) {
            Some((success_rate, sample_size)) if sample_size >= 5 => (1.0 - success_rate) * 100.0,
            _ => 50.0,
        }
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
            && !matches!(err, EmitterError::Closed)
        {
            tracing::warn!(error = %err, "failed to emit complexity event");
        }
    }
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses tokens like `15m`, `4h`, `1d` into a 0-100 contribution; shorter
/// durations score lower, day-scale estimates score at least 65.
fn parse_effort_score(estimate: &str) -> Option<f64> {
    let trimmed = estimate.trim();
    let (digits, unit) = trimmed.split_at(trimmed.len().checked_sub(1)?);
    let value: f64 = digits.parse().ok()?;
    let minutes = match unit {
        "m" => value,
        "h" => value * 60.0,
        "d" => value * 60.0 * 24.0,
        "w" => value * 60.0 * 24.0 * 7.0,
        _ => return None,
    };
    Some(if minutes >= 60.0 * 24.0 {
        (65.0 + (minutes / (60.0 * 24.0)) * 5.0).min(100.0)
    } else if minutes >= 60.0 {
        30.0 + (minutes / 60.0) * 5.0
    } else {
        (minutes / 60.0) * 30.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_manager::TaskManager;

    fn simple_task() -> Task {
        TaskManager::blank_task("t1", "Fix typo", "Fix typo in README")
    }

    #[test]
    fn baseline_score_for_trivial_task() {
        let analyzer = ComplexityAnalyzer::new();
        let mut task = simple_task();
        task.estimate = Some("5m".to_string());
        let result = analyzer.analyze(&task, 0, false);
        assert_eq!(result.strategy, Strategy::FastPath);
    }

    #[test]
    fn acceptance_criteria_length_zero_is_baseline() {
        let analyzer = ComplexityAnalyzer::new();
        let task = simple_task();
        let result = analyzer.analyze(&task, 0, false);
        assert_eq!(result.breakdown.acceptance_criteria, 10.0);
    }

    #[test]
    fn day_scale_estimate_scores_at_least_65() {
        assert!(parse_effort_score("1d").unwrap() >= 65.0);
    }

    #[test]
    fn cache_returns_same_result_until_invalidated() {
        let analyzer = ComplexityAnalyzer::new();
        let task = simple_task();
        let first = analyzer.analyze(&task, 0, true);
        let second = analyzer.analyze(&task, 0, true);
        assert_eq!(first.analyzed_at, second.analyzed_at);
    }

    #[test]
    fn use_cache_false_forces_fresh_timestamp() {
        let analyzer = ComplexityAnalyzer::new();
        let task = simple_task();
        let first = analyzer.analyze(&task, 0, true);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = analyzer.analyze(&task, 0, false);
        assert!(second.analyzed_at >= first.analyzed_at);
    }

    #[test]
    fn security_keyword_raises_technical_score() {
        let analyzer = ComplexityAnalyzer::new();
        let mut task = simple_task();
        task.description = "Rework the authentication and credential storage".to_string();
        let result = analyzer.analyze(&task, 0, false);
        assert!(result.breakdown.technical_keywords > 0.0);
    }
}
