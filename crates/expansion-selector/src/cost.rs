//! AI cost limiting
//!
//! Only the top slice of the final selection gets an AI rationale; the rest
//! get the template. The summary estimates what the skipped calls would
//! have cost.

use crate::config::{AiBudget, ExpansionConfig};
use crate::ScoredCandidate;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Share of the per-call token budget priced at the input rate
pub const INPUT_TOKEN_SHARE: f64 = 0.7;
pub const OUTPUT_TOKEN_SHARE: f64 = 0.3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_candidates: usize,
    pub ai_candidates: usize,
    pub template_candidates: usize,
    /// Selected for AI but served a template (provider error, refusal, absent)
    pub ai_fallbacks: usize,
    pub estimated_tokens_saved: u64,
    pub estimated_usd_saved: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EnrichmentPlan {
    /// Indices into the input list, in rank order
    pub enrich: Vec<usize>,
    pub skip: Vec<usize>,
    pub summary: CostSummary,
}

/// `min(ceil(total · pct / 100), cap, total)`
pub fn ai_candidate_count(total: usize, percentage: f64, cap: usize) -> usize {
    let by_share = (total as f64 * percentage / 100.0).ceil().max(0.0) as usize;
    by_share.min(cap).min(total)
}

/// Estimated USD cost of one enrichment call
pub fn cost_per_call_usd(budget: &AiBudget) -> f64 {
    let thousands = budget.avg_tokens_per_call as f64 / 1000.0;
    thousands * (INPUT_TOKEN_SHARE * budget.input_usd_per_1k_tokens + OUTPUT_TOKEN_SHARE * budget.output_usd_per_1k_tokens)
}

pub struct AiCostLimiter {
    budget: AiBudget,
    cap: usize,
}

impl AiCostLimiter {
    pub fn new(config: &ExpansionConfig) -> Self {
        Self {
            budget: config.ai,
            cap: config.ai_cap(),
        }
    }

    /// Pick the top candidates by score for AI enrichment
    pub fn select_for_enrichment(&self, candidates: &[ScoredCandidate]) -> EnrichmentPlan {
        let total = candidates.len();
        let count = ai_candidate_count(total, self.budget.percentage, self.cap);

        let mut order: Vec<usize> = (0..total).collect();
        order.sort_by(|&a, &b| crate::selector::by_rank(&candidates[a], &candidates[b]));
        let skip = order.split_off(count);
        let enrich = order;

        let skipped = skip.len() as u64;
        let summary = CostSummary {
            total_candidates: total,
            ai_candidates: enrich.len(),
            template_candidates: skip.len(),
            ai_fallbacks: 0,
            estimated_tokens_saved: skipped * self.budget.avg_tokens_per_call,
            estimated_usd_saved: skipped as f64 * cost_per_call_usd(&self.budget),
        };

        info!(
            "AI enrichment: {} of {} candidates (cap {}, {:.0}%), est. ${:.4} saved",
            summary.ai_candidates, total, self.cap, self.budget.percentage, summary.estimated_usd_saved
        );

        EnrichmentPlan { enrich, skip, summary }
    }
}
