//! Fatal batch failures.
//!
//! Everything recoverable (per-message parse errors, duplicate-lookup
//! errors, rule script faults, validator degradation) is logged and counted
//! instead. A [`PipelineError`] always means the batch produced zero items
//! and nothing was persisted.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("batch of {size} messages exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("rule evaluation failed: {0}")]
    RuleEvaluation(String),

    #[error("rule evaluation timed out after {0:?}")]
    RuleEvaluationTimeout(Duration),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("persistence timed out after {0:?}")]
    PersistenceTimeout(Duration),
}

impl PipelineError {
    /// Pipeline stage the failure belongs to, for log fields.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::BatchTooLarge { .. } => "validate_batch_size",
            Self::Generation(_) | Self::GenerationTimeout(_) => "generate",
            Self::RuleEvaluation(_) | Self::RuleEvaluationTimeout(_) => "rule_score",
            Self::Persistence(_) | Self::PersistenceTimeout(_) => "persist",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_descriptive() {
        let e = PipelineError::BatchTooLarge { size: 51, max: 50 };
        assert_eq!(e.to_string(), "batch of 51 messages exceeds the maximum of 50");
        assert_eq!(e.stage(), "validate_batch_size");
        assert_eq!(
            PipelineError::GenerationTimeout(Duration::from_secs(2)).to_string(),
            "generation timed out after 2s"
        );
        assert_eq!(
            PipelineError::RuleEvaluationTimeout(Duration::from_millis(1500)).stage(),
            "rule_score"
        );
    }
}
