//! Priority-ordered routing with circuit breaking and an optional terminal fallback.
//!
//! The router keeps an explicit capability-ordered chain of providers. For each request it walks
//! the chain in descending priority, skipping providers that lack the capability, serve another
//! embedding model, were excluded by the caller, or whose breaker is open. The first success wins;
//! every failure feeds the [`HealthTable`]. When nothing serves the request the caller receives
//! [`RouteError::Exhausted`] naming each provider tried and the last failure.

use super::health::{Admission, HealthSnapshot, HealthState, HealthTable};
use super::types::{
    Capability, Provider, ProviderDescriptor, ProviderError, ProviderRequest, ProviderResponse,
};
use crate::metrics::PipelineMetrics;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;

/// Circuit-breaker and timeout policy.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Consecutive failures that open a provider's circuit.
    pub failure_threshold: u32,
    /// How long an open circuit waits before a probe.
    pub cooldown: Duration,
    /// Default upper bound on one provider call.
    pub call_timeout: Duration,
    /// Number of recent routing decisions retained for inspection.
    pub decision_history: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            decision_history: 128,
        }
    }
}

/// Why a provider in the chain was not called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Circuit open and cooling down.
    Unhealthy,
    /// Another request is probing this provider.
    ProbeInFlight,
    /// Provider does not serve the requested capability.
    CapabilityMismatch,
    /// Provider embeds with a different model than the one pinned by the request.
    ModelMismatch,
    /// Caller excluded it explicitly.
    Excluded,
}

/// What happened to one provider while routing a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Not called.
    Skipped {
        /// Reason the provider was passed over.
        reason: SkipReason,
    },
    /// Called and failed.
    Failed {
        /// Failure description.
        error: String,
    },
    /// Called and answered.
    Served,
}

/// One entry of a routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    /// Provider name.
    pub provider: String,
    /// Whether it was skipped, failed, or served.
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Ordered record of how a request was routed.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// Capability requested.
    pub capability: Capability,
    /// Providers in the order they were considered.
    pub attempts: Vec<ProviderAttempt>,
    /// Provider that produced the response, if any.
    pub served_by: Option<String>,
    /// When routing finished.
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: OffsetDateTime,
}

impl RoutingDecision {
    /// Names of providers that were actually called.
    pub fn called(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .filter(|attempt| !matches!(attempt.outcome, AttemptOutcome::Skipped { .. }))
            .map(|attempt| attempt.provider.as_str())
            .collect()
    }

    fn fallbacks(&self) -> u64 {
        self.attempts
            .iter()
            .filter(|attempt| attempt.outcome != AttemptOutcome::Served)
            .count() as u64
    }
}

/// Final routing failures. Both are terminal for the request.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No registered provider advertises the capability.
    #[error("no provider is registered for {capability}")]
    NoProviders {
        /// Capability requested.
        capability: Capability,
    },
    /// Every eligible provider failed or was unavailable.
    #[error(
        "all providers exhausted for {capability} (attempted: [{}]); last failure: {last_error}",
        .attempted.join(", ")
    )]
    Exhausted {
        /// Capability requested.
        capability: Capability,
        /// Providers called, in order.
        attempted: Vec<String>,
        /// Last failure observed, or why nothing was callable.
        last_error: String,
        /// Full routing record.
        decision: RoutingDecision,
    },
}

/// A served request together with its routing record.
#[derive(Debug, Clone)]
pub struct Routed {
    /// Provider answer.
    pub response: ProviderResponse,
    /// How the answer was obtained.
    pub decision: RoutingDecision,
}

/// Provider descriptor joined with live health, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    /// Static description.
    pub descriptor: ProviderDescriptor,
    /// Live breaker view.
    pub health: HealthSnapshot,
}

/// Chooses a backend per request under partial availability.
pub struct ProviderRouter {
    chain: Vec<Arc<dyn Provider>>,
    health: HealthTable,
    settings: RouterSettings,
    decisions: Mutex<VecDeque<RoutingDecision>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl ProviderRouter {
    /// Build a router over `providers`, fixing their order once.
    ///
    /// Order: regular providers by descending priority (ties by name), then fallback-only ones.
    pub fn new(mut providers: Vec<Arc<dyn Provider>>, settings: RouterSettings) -> Self {
        providers.sort_by(|left, right| {
            let (left, right) = (left.descriptor(), right.descriptor());
            left.fallback_only
                .cmp(&right.fallback_only)
                .then_with(|| right.priority.cmp(&left.priority))
                .then_with(|| left.name.cmp(&right.name))
        });
        let health = HealthTable::new(
            providers
                .iter()
                .map(|provider| provider.descriptor().name.clone()),
            settings.failure_threshold,
            settings.cooldown,
        );
        tracing::debug!(
            chain = ?providers.iter().map(|p| p.descriptor().name.as_str()).collect::<Vec<_>>(),
            "Provider chain established"
        );
        Self {
            chain: providers,
            health,
            settings,
            decisions: Mutex::new(VecDeque::new()),
            metrics: None,
        }
    }

    /// Attach counters updated on every routed request.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Route a request through the provider chain.
    pub async fn route(&self, request: ProviderRequest) -> Result<Routed, RouteError> {
        self.route_excluding(request, &HashSet::new()).await
    }

    /// Route a request, skipping any provider named in `excluded`.
    pub async fn route_excluding(
        &self,
        request: ProviderRequest,
        excluded: &HashSet<String>,
    ) -> Result<Routed, RouteError> {
        let capability = request.capability();
        if !self
            .chain
            .iter()
            .any(|provider| provider.descriptor().supports(capability))
        {
            return Err(RouteError::NoProviders { capability });
        }

        let mut attempts = Vec::with_capacity(self.chain.len());
        let mut attempted = Vec::new();
        let mut last_error: Option<String> = None;

        for provider in &self.chain {
            let descriptor = provider.descriptor();
            let name = descriptor.name.clone();

            if let Some(reason) = ineligibility(descriptor, &request, excluded) {
                attempts.push(skipped(name, reason));
                continue;
            }

            let probing = match self.health.admit(&name) {
                Admission::Admit => false,
                Admission::Probe => true,
                Admission::RejectOpen => {
                    attempts.push(skipped(name, SkipReason::Unhealthy));
                    continue;
                }
                Admission::RejectProbeInFlight => {
                    attempts.push(skipped(name, SkipReason::ProbeInFlight));
                    continue;
                }
            };

            let probe = probing.then(|| self.health.probe_guard(name.as_str()));
            let timeout = descriptor.timeout.unwrap_or(self.settings.call_timeout);
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, provider.call(request.clone())).await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(timeout)),
            };
            let latency = started.elapsed();
            attempted.push(name.clone());

            let result = result.and_then(|response| validate_response(&request, response));
            match &result {
                Ok(_) => self.health.record_success(&name, latency),
                Err(_) => self.health.record_failure(&name, latency),
            }
            if let Some(probe) = probe {
                probe.settle();
            }

            match result {
                Ok(response) => {
                    attempts.push(ProviderAttempt {
                        provider: name.clone(),
                        outcome: AttemptOutcome::Served,
                    });
                    let decision = self.finish(capability, attempts, Some(name.clone()));
                    tracing::debug!(
                        provider = %name,
                        %capability,
                        probing,
                        latency_ms = latency.as_millis() as u64,
                        "Request served"
                    );
                    return Ok(Routed { response, decision });
                }
                Err(error) => {
                    tracing::warn!(
                        provider = %name,
                        %capability,
                        probing,
                        error = %error,
                        "Provider call failed; trying next in chain"
                    );
                    let message = format!("{name}: {error}");
                    attempts.push(ProviderAttempt {
                        provider: name,
                        outcome: AttemptOutcome::Failed {
                            error: error.to_string(),
                        },
                    });
                    last_error = Some(message);
                }
            }
        }

        let decision = self.finish(capability, attempts, None);
        let last_error =
            last_error.unwrap_or_else(|| "no eligible provider was available".to_string());
        tracing::error!(
            %capability,
            attempted = ?attempted,
            last_error = %last_error,
            "Provider chain exhausted"
        );
        Err(RouteError::Exhausted {
            capability,
            attempted,
            last_error,
            decision,
        })
    }

    /// Health for one provider.
    pub fn health_state(&self, name: &str) -> HealthState {
        self.health.state(name)
    }

    /// Every provider's descriptor with its live health, in chain order.
    pub fn health_report(&self) -> Vec<ProviderStatus> {
        let snapshots = self.health.snapshot();
        self.chain
            .iter()
            .filter_map(|provider| {
                let descriptor = provider.descriptor().clone();
                snapshots
                    .iter()
                    .find(|snapshot| snapshot.name == descriptor.name)
                    .cloned()
                    .map(|health| ProviderStatus { descriptor, health })
            })
            .collect()
    }

    /// Most recent routing decisions, oldest first.
    pub fn recent_decisions(&self) -> Vec<RoutingDecision> {
        self.decisions
            .lock()
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Provider names in routing order.
    pub fn chain(&self) -> Vec<String> {
        self.chain
            .iter()
            .map(|provider| provider.descriptor().name.clone())
            .collect()
    }

    fn finish(
        &self,
        capability: Capability,
        attempts: Vec<ProviderAttempt>,
        served_by: Option<String>,
    ) -> RoutingDecision {
        let decision = RoutingDecision {
            capability,
            attempts,
            served_by,
            decided_at: OffsetDateTime::now_utc(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_route(decision.fallbacks());
        }
        if self.settings.decision_history > 0
            && let Ok(mut log) = self.decisions.lock()
        {
            if log.len() >= self.settings.decision_history {
                log.pop_front();
            }
            log.push_back(decision.clone());
        }
        decision
    }
}

fn skipped(provider: String, reason: SkipReason) -> ProviderAttempt {
    ProviderAttempt {
        provider,
        outcome: AttemptOutcome::Skipped { reason },
    }
}

fn ineligibility(
    descriptor: &ProviderDescriptor,
    request: &ProviderRequest,
    excluded: &HashSet<String>,
) -> Option<SkipReason> {
    if !descriptor.supports(request.capability()) {
        return Some(SkipReason::CapabilityMismatch);
    }
    if excluded.contains(&descriptor.name) {
        return Some(SkipReason::Excluded);
    }
    if let ProviderRequest::Embed(embed) = request
        && descriptor.embedding_model.as_deref() != Some(embed.model.as_str())
    {
        return Some(SkipReason::ModelMismatch);
    }
    None
}

fn validate_response(
    request: &ProviderRequest,
    response: ProviderResponse,
) -> Result<ProviderResponse, ProviderError> {
    match (request, &response) {
        (ProviderRequest::Embed(embed), ProviderResponse::Embeddings(vectors)) => {
            if vectors.len() != embed.texts.len() {
                return Err(ProviderError::InvalidResponse(format!(
                    "expected {} vectors, got {}",
                    embed.texts.len(),
                    vectors.len()
                )));
            }
            Ok(response)
        }
        (ProviderRequest::Generate(_), ProviderResponse::Text(_)) => Ok(response),
        _ => Err(ProviderError::InvalidResponse(
            "response kind does not match request".into(),
        )),
    }
}
