//! Process-wide provider health table with per-provider circuit breakers.
//!
//! Every provider owns one [`ProviderHealth`] slot made of atomics. State changes between
//! `Closed`, `Open`, and `HalfOpen` are compare-and-swap transitions, so concurrent routing
//! decisions never take a global lock:
//!
//! - `Closed`: calls are admitted. Each failure bumps the consecutive-failure counter; reaching
//!   the threshold swaps the breaker to `Open` and stamps the open time.
//! - `Open`: calls are rejected until the cooldown elapses. The first caller to observe the
//!   elapsed cooldown wins `Open -> HalfOpen` and carries the single probe.
//! - `HalfOpen`: other callers skip the provider. A successful probe closes the breaker and
//!   resets the counter; a failed probe re-opens it with a fresh cooldown. A probe that never
//!   reports (its future was dropped) is handed back through [`ProbeGuard`], which re-opens the
//!   breaker so a later caller can probe again.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Externally visible health of a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HealthState {
    /// No recent failures.
    Healthy,
    /// Failing below the threshold, or being probed after a cooldown.
    Degraded,
    /// Circuit open; excluded from routing until the cooldown elapses.
    Unavailable,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Outcome of asking the table whether a provider may be called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Normal call on a closed breaker.
    Admit,
    /// This caller owns the half-open probe.
    Probe,
    /// Breaker is open and cooling down.
    RejectOpen,
    /// Another caller owns the probe.
    RejectProbeInFlight,
}

/// Atomic health slot for one provider.
#[derive(Debug, Default)]
pub struct ProviderHealth {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    last_latency_ms: AtomicU64,
}

/// Point-in-time view of one provider's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Provider name.
    pub name: String,
    /// Derived health state.
    pub state: HealthState,
    /// Current consecutive-failure count.
    pub consecutive_failures: u32,
    /// Successful calls since startup.
    pub total_successes: u64,
    /// Failed calls since startup.
    pub total_failures: u64,
    /// Latency of the most recent call in milliseconds.
    pub last_latency_ms: u64,
}

/// Health slots keyed by provider name plus the breaker policy.
#[derive(Debug)]
pub struct HealthTable {
    entries: HashMap<String, Arc<ProviderHealth>>,
    failure_threshold: u32,
    cooldown: Duration,
    epoch: Instant,
}

impl HealthTable {
    /// Build a table with one closed breaker per provider name.
    pub fn new<I, S>(names: I, failure_threshold: u32, cooldown: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = names
            .into_iter()
            .map(|name| (name.into(), Arc::new(ProviderHealth::default())))
            .collect();
        Self {
            entries,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Decide whether `name` may be called right now, claiming the probe when due.
    pub fn admit(&self, name: &str) -> Admission {
        let Some(slot) = self.entries.get(name) else {
            return Admission::RejectOpen;
        };
        match slot.state.load(Ordering::Acquire) {
            CLOSED => Admission::Admit,
            OPEN => {
                let opened_at = slot.opened_at_ms.load(Ordering::Acquire);
                let cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX);
                if self.now_ms().saturating_sub(opened_at) < cooldown_ms {
                    return Admission::RejectOpen;
                }
                match slot.state.compare_exchange(
                    OPEN,
                    HALF_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        tracing::info!(provider = name, "Cooldown elapsed; probing provider");
                        Admission::Probe
                    }
                    Err(CLOSED) => Admission::Admit,
                    Err(_) => Admission::RejectProbeInFlight,
                }
            }
            _ => Admission::RejectProbeInFlight,
        }
    }

    /// Record a successful call; closes a half-open breaker.
    pub fn record_success(&self, name: &str, latency: Duration) {
        let Some(slot) = self.entries.get(name) else {
            return;
        };
        slot.total_successes.fetch_add(1, Ordering::Relaxed);
        slot.last_latency_ms
            .store(duration_ms(latency), Ordering::Relaxed);
        slot.consecutive_failures.store(0, Ordering::Release);
        if slot
            .state
            .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!(provider = name, "Probe succeeded; provider healthy again");
        }
    }

    /// Record a failed call, opening the breaker when the threshold is crossed.
    pub fn record_failure(&self, name: &str, latency: Duration) {
        let Some(slot) = self.entries.get(name) else {
            return;
        };
        slot.total_failures.fetch_add(1, Ordering::Relaxed);
        slot.last_latency_ms
            .store(duration_ms(latency), Ordering::Relaxed);
        let failures = slot.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        slot.opened_at_ms.store(self.now_ms(), Ordering::Release);
        if slot
            .state
            .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(provider = name, "Probe failed; circuit re-opened");
            return;
        }
        if failures >= self.failure_threshold
            && slot
                .state
                .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::warn!(
                provider = name,
                failures,
                cooldown = ?self.cooldown,
                "Failure threshold reached; circuit opened"
            );
        }
    }

    /// Hold the half-open slot of `name` until a result is recorded.
    pub fn probe_guard(&self, name: impl Into<String>) -> ProbeGuard<'_> {
        ProbeGuard {
            table: self,
            name: name.into(),
            settled: false,
        }
    }

    fn release_probe(&self, name: &str) {
        let Some(slot) = self.entries.get(name) else {
            return;
        };
        slot.opened_at_ms.store(self.now_ms(), Ordering::Release);
        if slot
            .state
            .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(provider = name, "Probe abandoned before reporting; circuit re-opened");
        }
    }

    /// Derived health state for `name`; unknown providers read as unavailable.
    pub fn state(&self, name: &str) -> HealthState {
        self.entries
            .get(name)
            .map(|slot| derive_state(slot))
            .unwrap_or(HealthState::Unavailable)
    }

    /// Current consecutive-failure count for `name`.
    pub fn consecutive_failures(&self, name: &str) -> u32 {
        self.entries
            .get(name)
            .map(|slot| slot.consecutive_failures.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Snapshot of every slot, sorted by name.
    pub fn snapshot(&self) -> Vec<HealthSnapshot> {
        let mut snapshots: Vec<_> = self
            .entries
            .iter()
            .map(|(name, slot)| HealthSnapshot {
                name: name.clone(),
                state: derive_state(slot),
                consecutive_failures: slot.consecutive_failures.load(Ordering::Acquire),
                total_successes: slot.total_successes.load(Ordering::Relaxed),
                total_failures: slot.total_failures.load(Ordering::Relaxed),
                last_latency_ms: slot.last_latency_ms.load(Ordering::Relaxed),
            })
            .collect();
        snapshots.sort_by(|left, right| left.name.cmp(&right.name));
        snapshots
    }
}

/// Owner of a half-open probe.
///
/// Dropping an unsettled guard returns the breaker to `Open` with a fresh cooldown.
pub struct ProbeGuard<'a> {
    table: &'a HealthTable,
    name: String,
    settled: bool,
}

impl ProbeGuard<'_> {
    /// The probe reported through `record_success` or `record_failure`.
    pub fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.table.release_probe(&self.name);
        }
    }
}

fn derive_state(slot: &ProviderHealth) -> HealthState {
    match slot.state.load(Ordering::Acquire) {
        OPEN => HealthState::Unavailable,
        HALF_OPEN => HealthState::Degraded,
        _ if slot.consecutive_failures.load(Ordering::Acquire) > 0 => HealthState::Degraded,
        _ => HealthState::Healthy,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(threshold: u32, cooldown: Duration) -> HealthTable {
        HealthTable::new(["alpha"], threshold, cooldown)
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_probes_after_cooldown() {
        let table = table(2, Duration::from_secs(10));
        table.record_failure("alpha", Duration::ZERO);
        assert_eq!(table.state("alpha"), HealthState::Degraded);
        assert_eq!(table.admit("alpha"), Admission::Admit);

        table.record_failure("alpha", Duration::ZERO);
        assert_eq!(table.state("alpha"), HealthState::Unavailable);
        assert_eq!(table.admit("alpha"), Admission::RejectOpen);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(table.admit("alpha"), Admission::Probe);
        assert_eq!(table.admit("alpha"), Admission::RejectProbeInFlight);

        table.record_success("alpha", Duration::from_millis(5));
        assert_eq!(table.state("alpha"), HealthState::Healthy);
        assert_eq!(table.consecutive_failures("alpha"), 0);
        assert_eq!(table.admit("alpha"), Admission::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_restarts_cooldown() {
        let table = table(1, Duration::from_secs(5));
        table.record_failure("alpha", Duration::ZERO);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(table.admit("alpha"), Admission::Probe);

        table.record_failure("alpha", Duration::ZERO);
        assert_eq!(table.state("alpha"), HealthState::Unavailable);
        assert_eq!(table.admit("alpha"), Admission::RejectOpen);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(table.admit("alpha"), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_half_open_call_reopens_the_breaker() {
        let table = table(1, Duration::from_secs(10));
        table.record_failure("alpha", Duration::ZERO);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(table.admit("alpha"), Admission::Probe);

        drop(table.probe_guard("alpha"));
        assert_eq!(table.state("alpha"), HealthState::Unavailable);
        assert_eq!(table.admit("alpha"), Admission::RejectOpen);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(table.admit("alpha"), Admission::Probe);
        let guard = table.probe_guard("alpha");
        table.record_success("alpha", Duration::ZERO);
        guard.settle();
        assert_eq!(table.state("alpha"), HealthState::Healthy);
    }

    #[test]
    fn success_resets_degraded_counter() {
        let table = table(3, Duration::from_secs(1));
        table.record_failure("alpha", Duration::ZERO);
        table.record_failure("alpha", Duration::ZERO);
        table.record_success("alpha", Duration::ZERO);
        assert_eq!(table.state("alpha"), HealthState::Healthy);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].total_failures, 2);
        assert_eq!(snapshot[0].total_successes, 1);
    }

    #[test]
    fn unknown_provider_is_never_admitted() {
        let table = table(1, Duration::from_secs(1));
        assert_eq!(table.admit("ghost"), Admission::RejectOpen);
        assert_eq!(table.state("ghost"), HealthState::Unavailable);
    }
}
