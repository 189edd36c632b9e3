//! Tiered model cascade.
//!
//! Each tier maps to an ordered preference list. A generation walks that list,
//! skipping candidates in backoff or unable to serve the request shape. When
//! the tier is exhausted, a recovery pass retries every capable candidate from
//! every tier, least recently failing first, ignoring backoff.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aex_core::{
    AexError, AexResult, CapabilityFlags, CascadeConfig, ModelCallError, ModelCandidate,
    ModelClient, ModelRequest, ModelResponse, RequestedOutput, Tier,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::stats::{
    snapshot_from_value, snapshot_to_value, BackoffPolicy, CandidateStats, InMemoryStatsStore,
    StatsStore,
};

/// Which pass of the cascade an attempt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePass {
    Tier,
    Recovery,
}

/// One completed call to one candidate
#[derive(Debug, Clone)]
pub struct CascadeAttempt {
    pub candidate: ModelCandidate,
    pub pass: CascadePass,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<ModelCallError>,
}

impl CascadeAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Successful generation and how it was obtained
#[derive(Debug, Clone)]
pub struct Generation {
    pub response: ModelResponse,
    pub candidate: ModelCandidate,
    pub attempts: Vec<CascadeAttempt>,
}

impl Generation {
    pub fn used_recovery(&self) -> bool {
        self.attempts
            .last()
            .is_some_and(|a| a.pass == CascadePass::Recovery)
    }
}

/// Callback invoked after every attempt, successful or not
pub type AttemptObserver<'a> = &'a (dyn Fn(&CascadeAttempt) + Send + Sync);

pub struct ModelCascade {
    tiers: BTreeMap<Tier, Vec<ModelCandidate>>,
    client: Arc<dyn ModelClient>,
    stats: Arc<dyn StatsStore>,
    policy: BackoffPolicy,
    attempt_timeout: Duration,
}

impl std::fmt::Debug for ModelCascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCascade")
            .field("tiers", &self.tiers)
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

impl ModelCascade {
    pub fn new(config: &CascadeConfig, client: Arc<dyn ModelClient>) -> Self {
        Self {
            tiers: config.tiers.clone(),
            client,
            stats: Arc::new(InMemoryStatsStore::new()),
            policy: BackoffPolicy::from(config),
            attempt_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_stats_store(mut self, stats: Arc<dyn StatsStore>) -> Self {
        self.stats = stats;
        self
    }

    /// Timeout applied to each candidate attempt separately
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn stats(&self) -> &Arc<dyn StatsStore> {
        &self.stats
    }

    pub fn stats_for(&self, candidate: &ModelCandidate) -> CandidateStats {
        self.stats.get(&candidate.key()).unwrap_or_default()
    }

    /// Ordered preference list for a tier, with learned capabilities applied
    pub fn select_candidates(&self, tier: Tier) -> Vec<ModelCandidate> {
        self.tiers
            .get(&tier)
            .map(|list| list.iter().map(|c| self.effective(c)).collect())
            .unwrap_or_default()
    }

    /// Every known candidate across all tiers, first occurrence wins
    pub fn all_candidates(&self) -> Vec<ModelCandidate> {
        let mut seen = HashSet::new();
        self.tiers
            .values()
            .flatten()
            .filter(|c| seen.insert(c.key()))
            .map(|c| self.effective(c))
            .collect()
    }

    /// Whether the candidate is currently in backoff
    pub fn should_skip(&self, candidate: &ModelCandidate) -> bool {
        self.stats
            .get(&candidate.key())
            .and_then(|s| s.backoff_until(Utc::now(), &self.policy))
            .is_some()
    }

    /// Whether the candidate can serve the requested output shape
    pub fn is_capable(&self, candidate: &ModelCandidate, output: &RequestedOutput) -> bool {
        let flags = self.effective_flags(candidate);
        output
            .required_capabilities()
            .into_iter()
            .all(|cap| flags.supports(cap))
    }

    pub fn record_success(&self, candidate: &ModelCandidate) {
        self.stats.record_success(&candidate.key(), Utc::now());
    }

    pub fn record_error(&self, candidate: &ModelCandidate, error: &ModelCallError) {
        let key = candidate.key();
        if let ModelCallError::Unsupported(capability) = error {
            info!("Learned that {} does not support {}", candidate, capability);
            self.stats.record_unsupported(&key, *capability);
        }
        self.stats.record_error(&key, Utc::now(), &error.to_string());
    }

    pub async fn generate(&self, tier: Tier, request: &ModelRequest) -> AexResult<Generation> {
        self.generate_observed(tier, request, &|_: &CascadeAttempt| {})
            .await
    }

    /// Run the cascade, reporting every attempt to `observer` as it completes
    pub async fn generate_observed(
        &self,
        tier: Tier,
        request: &ModelRequest,
        observer: AttemptObserver<'_>,
    ) -> AexResult<Generation> {
        let mut attempts = Vec::new();

        for candidate in self.select_candidates(tier) {
            if !self.is_capable(&candidate, &request.output) {
                debug!("Skipping {}: cannot serve requested output", candidate);
                continue;
            }
            if self.should_skip(&candidate) {
                warn!("Skipping {}: in backoff", candidate);
                continue;
            }
            if let Some(response) = self
                .attempt(&candidate, request, CascadePass::Tier, &mut attempts, observer)
                .await
            {
                return Ok(Generation {
                    response,
                    candidate,
                    attempts,
                });
            }
        }

        let mut recovery: Vec<ModelCandidate> = self
            .all_candidates()
            .into_iter()
            .filter(|c| self.is_capable(c, &request.output))
            .collect();

        if recovery.is_empty() {
            return Err(AexError::NoCandidates { tier });
        }

        let now = Utc::now();
        recovery.sort_by_cached_key(|c| self.stats_for(c).recent_errors(now, self.policy.decay_window));
        warn!(
            "Tier {} exhausted after {} attempts, starting recovery pass over {} candidates",
            tier,
            attempts.len(),
            recovery.len()
        );

        for candidate in recovery {
            if let Some(response) = self
                .attempt(&candidate, request, CascadePass::Recovery, &mut attempts, observer)
                .await
            {
                return Ok(Generation {
                    response,
                    candidate,
                    attempts,
                });
            }
        }

        let last_error = attempts
            .iter()
            .rev()
            .find_map(|a| a.error.as_ref().map(|e| format!("{}: {}", a.candidate, e)))
            .unwrap_or_else(|| "no attempt was made".to_string());

        Err(AexError::CascadeExhausted {
            tier,
            attempts: attempts.len(),
            last_error,
        })
    }

    async fn attempt(
        &self,
        candidate: &ModelCandidate,
        request: &ModelRequest,
        pass: CascadePass,
        attempts: &mut Vec<CascadeAttempt>,
        observer: AttemptObserver<'_>,
    ) -> Option<ModelResponse> {
        debug!("Calling {} ({:?} pass)", candidate, pass);
        let started_at = Utc::now();
        let start = Instant::now();

        let result = tokio::time::timeout(self.attempt_timeout, self.client.call(request, candidate))
            .await
            .unwrap_or(Err(ModelCallError::Timeout));

        let (response, error) = match result {
            Ok(response) => {
                self.record_success(candidate);
                (Some(response), None)
            }
            Err(e) => {
                warn!("Model call to {} failed: {}", candidate, e);
                self.record_error(candidate, &e);
                (None, Some(e))
            }
        };

        let attempt = CascadeAttempt {
            candidate: candidate.clone(),
            pass,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            error,
        };
        observer(&attempt);
        attempts.push(attempt);
        response
    }

    pub fn export_stats(&self) -> AexResult<Value> {
        snapshot_to_value(&self.stats.export())
    }

    pub fn restore_stats(&self, value: Value) -> AexResult<()> {
        self.stats.restore(snapshot_from_value(value)?);
        Ok(())
    }

    fn effective_flags(&self, candidate: &ModelCandidate) -> CapabilityFlags {
        let mut flags = candidate.capabilities;
        if let Some(stats) = self.stats.get(&candidate.key()) {
            for capability in stats.unsupported {
                flags = flags.without(capability);
            }
        }
        flags
    }

    fn effective(&self, candidate: &ModelCandidate) -> ModelCandidate {
        candidate
            .clone()
            .with_capabilities(self.effective_flags(candidate))
    }
}
