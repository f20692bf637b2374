//! Scores and ranks competing plans across weighted criteria (spec §4.K).

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;
#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

use crate::event_bus::{EmitterError, Event, EventEmitter, PlanEvent};

#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum PlanEvaluatorError {
    #[error("weights must sum to 1.0")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::plan_evaluator::weights_sum)))]
    WeightsMustSumToOne,
    #[error("comparePlans requires between 2 and 5 plans, got {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(swarmctl::plan_evaluator::compare_count)))]
    InvalidCompareCount(usize),
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub description: String,
    pub owner: Option<String>,
    pub depends_on: Vec<usize>,
    pub risk_note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub steps: Vec<PlanStep>,
    pub goals: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CriteriaWeights {
    pub completeness: f64,
    pub feasibility: f64,
    pub risk: f64,
    pub clarity: f64,
    pub efficiency: f64,
}

impl Default for CriteriaWeights {
    fn default() -> Self {
        Self { completeness: 0.25, feasibility: 0.25, risk: 0.2, clarity: 0.15, efficiency: 0.15 }
    }
}

impl CriteriaWeights {
    fn sum(&self) -> f64 {
        self.completeness + self.feasibility + self.risk + self.clarity + self.efficiency
    }

    pub fn validate(&self) -> Result<(), PlanEvaluatorError> {
        if (self.sum() - 1.0).abs() > 0.01 {
            return Err(PlanEvaluatorError::WeightsMustSumToOne);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CriterionBreakdown {
    pub components: FxHashMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanScores {
    pub completeness: f64,
    pub feasibility: f64,
    pub risk: f64,
    pub clarity: f64,
    pub efficiency: f64,
}

#[derive(Debug, Clone)]
pub struct PlanEvaluation {
    pub plan_title: String,
    pub scores: PlanScores,
    pub breakdown: FxHashMap<String, CriterionBreakdown>,
    pub total_score: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlanRanking {
    pub plan_id: String,
    pub total_score: f64,
    pub rank: usize,
}

#[derive(Debug, Clone)]
pub struct PlanComparison {
    pub rankings: Vec<PlanRanking>,
    pub winner: String,
    pub margin: f64,
    pub needs_review: bool,
}

const TIE_THRESHOLD: f64 = 5.0;

const RISK_HEDGE_WORDS: &[&str] = &["mitigate", "fallback", "rollback", "contingency", "monitor"];
const VAGUE_WORDS: &[&str] = &["somehow", "maybe", "stuff", "etc", "various things"];

pub struct PlanEvaluator {
    weights: CriteriaWeights,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl PlanEvaluator {
    pub fn new() -> Self {
        Self { weights: CriteriaWeights::default(), emitter: None }
    }

    pub fn with_weights(weights: CriteriaWeights) -> Result<Self, PlanEvaluatorError> {
        weights.validate()?;
        Ok(Self { weights, emitter: None })
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    #[tracing::instrument(skip(self, plan), fields(plan = %plan.title))]
    pub fn evaluate_plan(&self, plan: &Plan) -> PlanEvaluation {
        let completeness = self.score_completeness(plan);
        let feasibility = self.score_feasibility(plan);
        let risk = self.score_risk(plan);
        let clarity = self.score_clarity(plan);
        let efficiency = self.score_efficiency(plan);

        let total_score = completeness * self.weights.completeness
            + feasibility * self.weights.feasibility
            + risk * self.weights.risk
            + clarity * self.weights.clarity
            + efficiency * self.weights.efficiency;

        let mut recommendations = Vec::new();
        if completeness < 60.0 {
            recommendations.push("add steps covering remaining goals".to_string());
        }
        if risk < 60.0 {
            recommendations.push("add mitigations or rollback steps for risky work".to_string());
        }
        if clarity < 60.0 {
            recommendations.push("replace vague language with specific, actionable steps".to_string());
        }
        if efficiency < 60.0 {
            recommendations.push("identify steps that can run in parallel".to_string());
        }

        let mut breakdown = FxHashMap::default();
        breakdown.insert("completeness".to_string(), CriterionBreakdown { components: [("goalsCovered".to_string(), completeness)].into_iter().collect() });
        breakdown.insert("feasibility".to_string(), CriterionBreakdown { components: [("ownershipCoverage".to_string(), feasibility)].into_iter().collect() });
        breakdown.insert("risk".to_string(), CriterionBreakdown { components: [("hedgeCoverage".to_string(), risk)].into_iter().collect() });
        breakdown.insert("clarity".to_string(), CriterionBreakdown { components: [("specificity".to_string(), clarity)].into_iter().collect() });
        breakdown.insert("efficiency".to_string(), CriterionBreakdown { components: [("parallelizable".to_string(), efficiency)].into_iter().collect() });

        let evaluation = PlanEvaluation {
            plan_title: plan.title.clone(),
            scores: PlanScores { completeness, feasibility, risk, clarity, efficiency },
            breakdown,
            total_score,
            recommendations,
        };

        self.emit(Event::Plan(PlanEvent::Evaluated { plan_title: plan.title.clone(), total_score: evaluation.total_score }));
        evaluation
    }

    pub fn compare_plans(&self, plans: &[Plan]) -> Result<PlanComparison, PlanEvaluatorError> {
        if !(2..=5).contains(&plans.len()) {
            return Err(PlanEvaluatorError::InvalidCompareCount(plans.len()));
        }

        let mut scored: Vec<(String, f64)> = plans.iter().map(|p| (p.id.clone(), self.evaluate_plan(p).total_score)).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let rankings: Vec<PlanRanking> = scored
            .iter()
            .enumerate()
            .map(|(i, (id, score))| PlanRanking { plan_id: id.clone(), total_score: *score, rank: i + 1 })
            .collect();

        let winner = rankings[0].plan_id.clone();
        let margin = if rankings.len() > 1 { rankings[0].total_score - rankings[1].total_score } else { 100.0 };
        let needs_review = margin < TIE_THRESHOLD;

        Ok(PlanComparison { rankings, winner, margin, needs_review })
    }

    fn score_completeness(&self, plan: &Plan) -> f64 {
        if plan.goals.is_empty() {
            return if plan.steps.is_empty() { 0.0 } else { 70.0 };
        }
        let haystack = plan.steps.iter().map(|s| s.description.to_lowercase()).collect::<Vec<_>>().join(" ");
        let covered = plan.goals.iter().filter(|g| haystack.contains(&g.to_lowercase())).count();
        ((covered as f64 / plan.goals.len() as f64) * 100.0).min(100.0)
    }

    fn score_feasibility(&self, plan: &Plan) -> f64 {
        if plan.steps.is_empty() {
            return 0.0;
        }
        let owned = plan.steps.iter().filter(|s| s.owner.is_some()).count();
        let has_valid_deps = plan.steps.iter().all(|s| s.depends_on.iter().all(|&d| d < plan.steps.len()));
        let ownership_score = (owned as f64 / plan.steps.len() as f64) * 100.0;
        if has_valid_deps { ownership_score } else { ownership_score * 0.5 }
    }

    fn score_risk(&self, plan: &Plan) -> f64 {
        if plan.steps.is_empty() {
            return 0.0;
        }
        let hedged = plan
            .steps
            .iter()
            .filter(|s| {
                let text = format!("{} {}", s.description, s.risk_note.clone().unwrap_or_default()).to_lowercase();
                RISK_HEDGE_WORDS.iter().any(|w| text.contains(w))
            })
            .count();
        let with_notes = plan.steps.iter().filter(|s| s.risk_note.is_some()).count();
        (((hedged + with_notes) as f64 / (plan.steps.len() as f64 * 2.0)) * 100.0).min(100.0)
    }

    fn score_clarity(&self, plan: &Plan) -> f64 {
        if plan.steps.is_empty() {
            return 0.0;
        }
        let vague = plan
            .steps
            .iter()
            .filter(|s| {
                let text = s.description.to_lowercase();
                VAGUE_WORDS.iter().any(|w| text.contains(w))
            })
            .count();
        let specific_length = plan.steps.iter().filter(|s| s.description.split_whitespace().count() >= 4).count();
        let base = (specific_length as f64 / plan.steps.len() as f64) * 100.0;
        (base - (vague as f64 / plan.steps.len() as f64) * 50.0).clamp(0.0, 100.0)
    }

    fn score_efficiency(&self, plan: &Plan) -> f64 {
        if plan.steps.is_empty() {
            return 0.0;
        }
        let parallelizable = plan.steps.iter().filter(|s| s.depends_on.is_empty()).count();
        ((parallelizable as f64 / plan.steps.len() as f64) * 100.0).min(100.0)
    }

    fn emit(&self, event: Event) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(event)
            && !matches!(err, EmitterError::Closed)
        {
            tracing::warn!(error = %err, "failed to emit plan event");
        }
    }
}

impl Default for PlanEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(title: &str, steps: Vec<PlanStep>, goals: Vec<&str>) -> Plan {
        Plan { id: title.to_lowercase(), title: title.to_string(), steps, goals: goals.into_iter().map(String::from).collect() }
    }

    #[test]
    fn custom_weights_must_sum_to_one() {
        let weights = CriteriaWeights { completeness: 0.5, feasibility: 0.5, risk: 0.5, clarity: 0.0, efficiency: 0.0 };
        assert!(PlanEvaluator::with_weights(weights).is_err());
    }

    #[test]
    fn empty_plan_scores_zero_completeness() {
        let evaluator = PlanEvaluator::new();
        let plan = plan_with("Empty", vec![], vec!["ship feature"]);
        let result = evaluator.evaluate_plan(&plan);
        assert_eq!(result.scores.completeness, 0.0);
    }

    #[test]
    fn parallel_steps_score_high_efficiency() {
        let evaluator = PlanEvaluator::new();
        let plan = plan_with(
            "Parallel",
            vec![
                PlanStep { description: "implement parser module".to_string(), owner: Some("a".to_string()), depends_on: vec![], risk_note: None },
                PlanStep { description: "implement writer module".to_string(), owner: Some("b".to_string()), depends_on: vec![], risk_note: None },
            ],
            vec![],
        );
        let result = evaluator.evaluate_plan(&plan);
        assert_eq!(result.scores.efficiency, 100.0);
    }

    #[test]
    fn compare_plans_rejects_out_of_range_counts() {
        let evaluator = PlanEvaluator::new();
        let single = vec![plan_with("Solo", vec![], vec![])];
        assert!(matches!(evaluator.compare_plans(&single), Err(PlanEvaluatorError::InvalidCompareCount(1))));
    }

    #[test]
    fn compare_plans_ranks_by_total_score_descending() {
        let evaluator = PlanEvaluator::new();
        let strong = plan_with(
            "Strong",
            vec![
                PlanStep { description: "migrate schema with rollback plan".to_string(), owner: Some("a".to_string()), depends_on: vec![], risk_note: Some("mitigate with backup".to_string()) },
            ],
            vec!["migrate schema"],
        );
        let weak = plan_with("Weak", vec![PlanStep { description: "do stuff".to_string(), owner: None, depends_on: vec![], risk_note: None }], vec!["migrate schema"]);
        let comparison = evaluator.compare_plans(&[strong, weak]).unwrap();
        assert_eq!(comparison.winner, "strong");
        assert_eq!(comparison.rankings[0].rank, 1);
    }

    #[test]
    fn close_scores_flagged_for_review() {
        let evaluator = PlanEvaluator::new();
        let step = PlanStep { description: "do the work carefully".to_string(), owner: Some("a".to_string()), depends_on: vec![], risk_note: None };
        let a = plan_with("A", vec![step.clone()], vec![]);
        let b = plan_with("B", vec![step], vec![]);
        let comparison = evaluator.compare_plans(&[a, b]).unwrap();
        assert!(comparison.needs_review);
    }
}
