//! Ensemble dispatcher: JoinSet fan-out/fan-in over profile members.
//!
//! ```text
//! dispatch(task, profile, prompt)
//!   ├─ JoinSet::spawn(member_i) × N      (Semaphore-bounded)
//!   │     └─ attempt ≤ max_attempts
//!   │          timeout(member_timeout, backend.complete)
//!   │          adapter.normalize(reply, categories)
//!   │          transport error → backoff, retry; adapter error → stop
//!   └─ join_next() until every member settled (or cancel fires)
//! ```
//!
//! Never fails fast: a dispatch returns once every member has either voted
//! or failed, reporting both sets in profile order. Only cancellation cuts
//! it short.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{category_key, AdapterSet};
use crate::aggregator::MemberVote;
use crate::backend::{Backend, BackendRequest, BackendSet, Message, ResponseOption};
use crate::config::EngineConfig;
use crate::error::{FailureKind, MemberError, MemberFailure, TransportError};
use crate::profile::{EnsembleMember, EnsembleProfile};

/// Rendered prompt shared by every member of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub messages: Vec<Message>,
    pub categories: Vec<String>,
}

impl Prompt {
    pub fn new(messages: Vec<Message>, categories: Vec<String>) -> Self {
        Self {
            messages,
            categories,
        }
    }

    fn responses(&self) -> Vec<ResponseOption> {
        self.categories
            .iter()
            .enumerate()
            .map(|(i, label)| ResponseOption {
                key: category_key(i),
                label: label.clone(),
            })
            .collect()
    }

    fn request_for(&self, member: &EnsembleMember) -> BackendRequest {
        BackendRequest {
            member: member.id.clone(),
            model: member.model.clone(),
            mode: member.mode,
            messages: self.messages.clone(),
            responses: self.responses(),
            options: member.options.clone(),
        }
    }
}

/// Settled state of every member of one dispatch, in profile order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    pub votes: Vec<MemberVote>,
    pub failures: Vec<MemberFailure>,
}

impl DispatchOutcome {
    pub fn all_failed(&self) -> bool {
        self.votes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dispatch cancelled")]
pub struct DispatchCancelled;

/// Fans one task out to its ensemble.
///
/// The semaphore is per dispatcher; the pipeline builds one dispatcher per
/// invocation so all of an invocation's tasks share one bounded pool.
#[derive(Clone)]
pub struct EnsembleDispatcher {
    backends: Arc<BackendSet>,
    adapters: Arc<AdapterSet>,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
}

impl EnsembleDispatcher {
    pub fn new(backends: Arc<BackendSet>, config: &EngineConfig) -> Self {
        Self {
            backends,
            adapters: Arc::new(AdapterSet::new(config.renormalize_tolerance)),
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config: Arc::new(config.clone()),
        }
    }

    pub async fn dispatch(
        &self,
        task: usize,
        profile: &EnsembleProfile,
        prompt: Arc<Prompt>,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, DispatchCancelled> {
        let start = Instant::now();
        let members = profile.members();
        let mut settled: Vec<Option<Result<Vec<f64>, MemberFailure>>> = vec![None; members.len()];
        let mut join_set: JoinSet<(usize, Result<Vec<f64>, MemberFailure>)> = JoinSet::new();

        for (slot, member) in members.iter().enumerate() {
            let backend = match self.backends.resolve(member.backend.as_deref()) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(task, member = %member.id, error = %e, "member has no backend");
                    settled[slot] = Some(Err(MemberFailure::new(&member.id, &e.into(), 0)));
                    continue;
                }
            };
            let call = MemberCall {
                task,
                member: member.clone(),
                request: prompt.request_for(member),
                prompt: Arc::clone(&prompt),
                backend,
                adapters: Arc::clone(&self.adapters),
                permits: Arc::clone(&self.permits),
                config: Arc::clone(&self.config),
            };
            join_set.spawn(async move { (slot, call.run().await) });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    warn!(task, "dispatch cancelled, in-flight member calls aborted");
                    return Err(DispatchCancelled);
                }
                next = join_set.join_next() => match next {
                    None => break,
                    Some(Ok((slot, result))) => settled[slot] = Some(result),
                    Some(Err(e)) => warn!(task, error = %e, "member call panicked"),
                },
            }
        }

        let mut outcome = DispatchOutcome::default();
        for (member, slot) in members.iter().zip(settled) {
            match slot {
                Some(Ok(scores)) => outcome.votes.push(MemberVote {
                    member: member.id.clone(),
                    weight: member.weight,
                    scores,
                }),
                Some(Err(failure)) => outcome.failures.push(failure),
                None => outcome.failures.push(MemberFailure {
                    member: member.id.clone(),
                    kind: FailureKind::Aborted,
                    reason: "member call panicked".to_string(),
                    attempts: 1,
                }),
            }
        }

        info!(
            task,
            succeeded = outcome.votes.len(),
            failed = outcome.failures.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "ensemble dispatch settled"
        );
        Ok(outcome)
    }
}

/// Everything one spawned member call owns.
struct MemberCall {
    task: usize,
    member: EnsembleMember,
    request: BackendRequest,
    prompt: Arc<Prompt>,
    backend: Arc<dyn Backend>,
    adapters: Arc<AdapterSet>,
    permits: Arc<Semaphore>,
    config: Arc<EngineConfig>,
}

impl MemberCall {
    async fn run(self) -> Result<Vec<f64>, MemberFailure> {
        let mut attempt = 1;
        loop {
            match self.attempt().await {
                Ok(scores) => {
                    debug!(task = self.task, member = %self.member.id, attempt, "member voted");
                    return Ok(scores);
                }
                Err(e) if e.is_retriable() && attempt < self.config.max_attempts() => {
                    warn!(
                        task = self.task,
                        member = %self.member.id,
                        attempt,
                        error = %e,
                        "member attempt failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        task = self.task,
                        member = %self.member.id,
                        attempt,
                        kind = %e.kind(),
                        error = %e,
                        "member excluded"
                    );
                    return Err(MemberFailure::new(&self.member.id, &e, attempt));
                }
            }
        }
    }

    async fn attempt(&self) -> Result<Vec<f64>, MemberError> {
        // The permit covers the network call only, never the backoff sleep.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Connection("dispatcher pool closed".to_string()))?;

        let deadline = self.config.member_timeout();
        let reply = tokio::time::timeout(deadline, self.backend.complete(&self.request))
            .await
            .map_err(|_| TransportError::Timeout(deadline))??;

        let scores = self
            .adapters
            .get(self.member.mode)
            .normalize(&reply, &self.prompt.categories)?;
        Ok(scores)
    }
}
