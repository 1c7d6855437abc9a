//! Dual-engine confidence scoring.
//!
//! | Mode | Rule weight | Adapter weight | Ceiling |
//! |------|-------------|----------------|---------|
//! | normal | 0.5 | 0.5 | 1.0 |
//! | degraded | 0.6 | 0.2 | `degraded_max` (0.6) |
//!
//! In degraded mode the missing 0.2 is a structural discount. Inputs are
//! clamped into `[0, 1]` (non-finite values count as 0), so the result is
//! always a finite value in `[0, 1]`.

use serde::Serialize;

use crate::models::CandidateItem;
use crate::rules::RuleResult;

const NORMAL_RULE_WEIGHT: f64 = 0.5;
const NORMAL_ADAPTER_WEIGHT: f64 = 0.5;
const DEGRADED_RULE_WEIGHT: f64 = 0.6;
const DEGRADED_ADAPTER_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceContext {
    pub is_degraded: bool,
    /// Ceiling applied in degraded mode.
    pub max_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceResult {
    pub final_confidence: f64,
    pub rule_contribution: f64,
    pub adapter_contribution: f64,
    pub degraded: bool,
    pub capped: bool,
}

fn unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Combine a normalized rule score and an adapter confidence.
pub fn combine(rule_score: f64, adapter_confidence: f64, ctx: ConfidenceContext) -> ConfidenceResult {
    let rule = unit(rule_score);
    let adapter = unit(adapter_confidence);

    let (rule_w, adapter_w) = if ctx.is_degraded {
        (DEGRADED_RULE_WEIGHT, DEGRADED_ADAPTER_WEIGHT)
    } else {
        (NORMAL_RULE_WEIGHT, NORMAL_ADAPTER_WEIGHT)
    };
    let rule_contribution = rule_w * rule;
    let adapter_contribution = adapter_w * adapter;
    let weighted = unit(rule_contribution + adapter_contribution);

    let (final_confidence, capped) = if ctx.is_degraded {
        let ceiling = unit(ctx.max_confidence);
        if weighted > ceiling {
            (ceiling, true)
        } else {
            (weighted, false)
        }
    } else {
        (weighted, false)
    };

    ConfidenceResult {
        final_confidence,
        rule_contribution,
        adapter_contribution,
        degraded: ctx.is_degraded,
        capped,
    }
}

/// Score an item against the rule result of its source message.
pub fn calculate(
    rule_result: &RuleResult,
    item: &CandidateItem,
    ctx: ConfidenceContext,
) -> ConfidenceResult {
    combine(rule_result.normalized(), item.confidence, ctx)
}

/// Score an item within its batch.
///
/// The rule result is resolved through the item's first source index;
/// items with no (known) source index use the batch mean rule score.
pub fn score_item(
    item: &CandidateItem,
    rule_results: &[RuleResult],
    ctx: ConfidenceContext,
) -> ConfidenceResult {
    match item.source_indices.first().and_then(|i| rule_results.get(*i)) {
        Some(rule_result) => calculate(rule_result, item, ctx),
        None => combine(mean_rule_score(rule_results), item.confidence, ctx),
    }
}

pub fn mean_rule_score(rule_results: &[RuleResult]) -> f64 {
    if rule_results.is_empty() {
        return 0.0;
    }
    rule_results.iter().map(RuleResult::normalized).sum::<f64>() / rule_results.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemType, SourceStatus};

    const NORMAL: ConfidenceContext = ConfidenceContext {
        is_degraded: false,
        max_confidence: 0.6,
    };
    const DEGRADED: ConfidenceContext = ConfidenceContext {
        is_degraded: true,
        max_confidence: 0.6,
    };

    fn scored(score: f64) -> RuleResult {
        RuleResult {
            score,
            ..Default::default()
        }
    }

    fn item(indices: Vec<usize>, confidence: f64) -> CandidateItem {
        CandidateItem {
            content: "x".into(),
            item_type: ItemType::Pending,
            source_indices: indices,
            evidence: String::new(),
            confidence,
            source_status: SourceStatus::Verified,
        }
    }

    #[test]
    fn test_normal_weights() {
        let r = combine(0.6, 0.8, NORMAL);
        assert!((r.final_confidence - 0.7).abs() < 1e-9);
        assert!(!r.capped && !r.degraded);
    }

    #[test]
    fn test_degraded_weights_and_cap() {
        let low = combine(0.5, 0.5, DEGRADED);
        assert!((low.final_confidence - 0.4).abs() < 1e-9);
        assert!(!low.capped);

        let high = combine(1.0, 1.0, DEGRADED);
        assert_eq!(high.final_confidence, 0.6);
        assert!(high.capped && high.degraded);
    }

    #[test]
    fn test_out_of_range_inputs_clamped() {
        let r = combine(f64::NAN, 7.0, NORMAL);
        assert!(r.final_confidence.is_finite());
        assert!((r.final_confidence - 0.5).abs() < 1e-9);
        assert_eq!(combine(-3.0, -1.0, NORMAL).final_confidence, 0.0);
    }

    #[test]
    fn test_first_index_precedence_and_mean_fallback() {
        let results = vec![scored(80.0), scored(20.0)];
        let first = score_item(&item(vec![1, 0], 0.0), &results, NORMAL);
        assert!((first.rule_contribution - 0.1).abs() < 1e-9);

        let mean = score_item(&item(vec![], 0.0), &results, NORMAL);
        assert!((mean.rule_contribution - 0.25).abs() < 1e-9);

        let empty = score_item(&item(vec![], 1.0), &[], NORMAL);
        assert!((empty.final_confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_calculate_uses_normalized_rule_score() {
        let r = calculate(&scored(100.0), &item(vec![0], 0.0), NORMAL);
        assert!((r.final_confidence - 0.5).abs() < 1e-9);
        assert!((r.rule_contribution - 0.5).abs() < 1e-9);
    }
}
