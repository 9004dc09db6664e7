//! Weighted aggregation of member votes.
//!
//! `aggregate[i] = Σ w_m · s_m[i] / Σ w_m` over the members that produced a
//! distribution. Failed members never enter the sum; zero-weight members
//! enter it but move nothing. The result is re-normalized so rounding in
//! the accumulation never drifts the sum away from 1.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{AggregationError, AggregationResult, FailureKind, MemberFailure};

/// A member's normalized distribution together with its weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberVote {
    pub member: String,
    pub weight: f64,
    pub scores: Vec<f64>,
}

/// Aggregated outcome of one ensemble task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// One probability per category; sums to 1.
    pub scores: Vec<f64>,
    /// Ids of the members whose votes carry weight in `scores`.
    pub members: Vec<String>,
    /// Members excluded from the aggregate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<MemberFailure>,
}

impl TaskResult {
    /// At least one member was excluded.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Value visible to expressions as `tasks[i]`.
    pub fn expr_value(&self) -> Value {
        json!({ "scores": self.scores })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreAggregator;

impl ScoreAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Combine surviving votes for a task with `categories` responses.
    ///
    /// Votes must already be normalized distributions of length
    /// `categories`; the adapters guarantee this.
    pub fn aggregate(
        &self,
        categories: usize,
        votes: &[MemberVote],
        mut failures: Vec<MemberFailure>,
    ) -> AggregationResult<TaskResult> {
        if votes.is_empty() {
            return Err(AggregationError::EnsembleExhausted { failures });
        }

        let total: f64 = votes.iter().map(|v| v.weight).sum();
        if total <= 0.0 {
            failures.extend(votes.iter().map(|v| MemberFailure {
                member: v.member.clone(),
                kind: FailureKind::ZeroWeight,
                reason: "member succeeded with weight 0".to_string(),
                attempts: 1,
            }));
            return Err(AggregationError::EnsembleExhausted { failures });
        }

        let weighted: Vec<&MemberVote> = votes.iter().filter(|v| v.weight > 0.0).collect();
        let members = weighted.iter().map(|v| v.member.clone()).collect();

        // A lone contributor skips the weighting; w·s/w is not always exact.
        let mut scores = match weighted.as_slice() {
            [only] => only.scores.clone(),
            _ => {
                let mut acc = vec![0.0_f64; categories];
                for vote in &weighted {
                    for (a, s) in acc.iter_mut().zip(&vote.scores) {
                        *a += vote.weight * s;
                    }
                }
                for a in acc.iter_mut() {
                    *a /= total;
                }
                acc
            }
        };

        // Adapters tolerate small drift from 1; the task result does not.
        let sum: f64 = scores.iter().sum();
        if sum > 0.0 && sum != 1.0 {
            for s in scores.iter_mut() {
                *s /= sum;
            }
        }

        debug!(
            contributing = weighted.len(),
            excluded = failures.len(),
            total_weight = total,
            "aggregated ensemble votes"
        );

        Ok(TaskResult {
            scores,
            members,
            failures,
        })
    }
}
