//! Per-provider concurrency limits for upstream model calls
//!
//! Every provider gets its own semaphore sized to `max_concurrent`. The
//! process-wide [`AdmissionStrategy`] decides what happens at capacity:
//! `reject` fails at once, `queue` waits up to the provider's timeout.
//!
//! The outcome of [`RateLimiter::acquire`] is an explicit [`Admission`]
//! value. Admitted calls hold a [`RatePermit`] that frees the slot on drop.

use crate::config::{AdmissionStrategy, ProviderBudget, RateLimiterConfig};
use crate::error::{Result, SandboxError};
use parking_lot::{Mutex, RwLock};
use sandcastle_observability::SandcastleMetrics;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

/// Live counters for one provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderMetrics {
    pub active_requests: usize,
    pub queued_requests: usize,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub total_completed: u64,
}

struct ProviderInner {
    budget: ProviderBudget,
    counters: ProviderMetrics,
    // Slots to retire as in-flight permits come back after a shrink
    shrink_debt: usize,
}

struct ProviderState {
    name: String,
    semaphore: Arc<Semaphore>,
    inner: Mutex<ProviderInner>,
    registry: Option<Arc<SandcastleMetrics>>,
}

impl ProviderState {
    fn new(name: &str, budget: ProviderBudget, registry: Option<Arc<SandcastleMetrics>>) -> Self {
        Self {
            name: name.to_string(),
            semaphore: Arc::new(Semaphore::new(budget.max_concurrent)),
            inner: Mutex::new(ProviderInner {
                budget,
                counters: ProviderMetrics::default(),
                shrink_debt: 0,
            }),
            registry,
        }
    }

    fn budget(&self) -> ProviderBudget {
        self.inner.lock().budget
    }

    fn counters(&self) -> ProviderMetrics {
        self.inner.lock().counters
    }

    fn publish_load(&self, counters: &ProviderMetrics) {
        if let Some(registry) = &self.registry {
            registry.set_rate_limit_load(
                &self.name,
                counters.active_requests,
                counters.queued_requests,
            );
        }
    }

    /// Apply a counter transition and mirror the live counts
    fn update(&self, f: impl FnOnce(&mut ProviderMetrics)) {
        let mut inner = self.inner.lock();
        f(&mut inner.counters);
        self.publish_load(&inner.counters);
    }

    /// Change the slot count without disturbing calls in flight
    ///
    /// Growing first cancels any outstanding shrink. Shrinking retires free
    /// slots at once and the rest as in-flight permits are returned.
    fn resize(&self, budget: ProviderBudget) {
        let mut inner = self.inner.lock();
        let old = inner.budget.max_concurrent;
        let new = budget.max_concurrent;
        inner.budget = budget;

        if new > old {
            let grow = new - old;
            let repaid = grow.min(inner.shrink_debt);
            inner.shrink_debt -= repaid;
            if grow > repaid {
                self.semaphore.add_permits(grow - repaid);
            }
        } else if old > new {
            let shrink = old - new;
            let retired = self.semaphore.forget_permits(shrink);
            inner.shrink_debt += shrink - retired;
        }
    }

    /// Return a slot; counters move before the permit is released
    fn release(&self, permit: OwnedSemaphorePermit) {
        let mut inner = self.inner.lock();
        inner.counters.active_requests = inner.counters.active_requests.saturating_sub(1);
        inner.counters.total_completed += 1;
        if inner.shrink_debt > 0 {
            inner.shrink_debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
        self.publish_load(&inner.counters);
    }

    fn admit(self: &Arc<Self>, permit: OwnedSemaphorePermit, waited: Duration) -> RatePermit {
        if let Some(registry) = &self.registry {
            registry.record_admission(&self.name, waited);
        }
        RatePermit {
            state: self.clone(),
            permit: Some(permit),
        }
    }

    fn reject(&self) {
        self.update(|c| c.total_rejected += 1);
        if let Some(registry) = &self.registry {
            registry.record_rejection(&self.name);
        }
    }
}

/// A held call slot; dropping it frees the slot
pub struct RatePermit {
    state: Arc<ProviderState>,
    permit: Option<OwnedSemaphorePermit>,
}

impl RatePermit {
    pub fn provider(&self) -> &str {
        &self.state.name
    }
}

impl std::fmt::Debug for RatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatePermit")
            .field("provider", &self.state.name)
            .finish()
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        self.state.release(permit);
        if let Some(registry) = &self.state.registry {
            registry.record_completion(&self.state.name);
        }
    }
}

/// Outcome of an acquisition attempt
#[derive(Debug)]
pub enum Admission {
    /// A slot was free
    Immediate(RatePermit),
    /// Waited in the queue, then got a slot
    Queued { permit: RatePermit, waited: Duration },
    /// At capacity under the `reject` strategy
    Rejected { provider: String, max_concurrent: usize },
    /// No slot freed up within the provider timeout
    TimedOut { provider: String, timeout: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Immediate(_) | Self::Queued { .. })
    }

    /// Convert to a permit or the matching exhaustion error
    pub fn into_result(self) -> Result<RatePermit> {
        match self {
            Self::Immediate(permit) | Self::Queued { permit, .. } => Ok(permit),
            Self::Rejected {
                provider,
                max_concurrent,
            } => Err(SandboxError::RateLimited {
                provider,
                max_concurrent,
            }),
            Self::TimedOut { provider, timeout } => {
                Err(SandboxError::QueueTimeout { provider, timeout })
            }
        }
    }
}

/// Counts a caller as queued until it leaves, including by cancellation
struct QueueSlot<'a> {
    state: &'a ProviderState,
    left: bool,
}

impl<'a> QueueSlot<'a> {
    fn enter(state: &'a ProviderState) -> Self {
        state.update(|c| c.queued_requests += 1);
        Self { state, left: false }
    }

    fn leave(mut self, f: impl FnOnce(&mut ProviderMetrics)) {
        self.left = true;
        self.state.update(|c| {
            c.queued_requests = c.queued_requests.saturating_sub(1);
            f(c);
        });
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if !self.left {
            self.state
                .update(|c| c.queued_requests = c.queued_requests.saturating_sub(1));
        }
    }
}

/// Caps concurrent in-flight calls per upstream provider
#[derive(Clone)]
pub struct RateLimiter {
    strategy: AdmissionStrategy,
    default_budget: ProviderBudget,
    providers: Arc<RwLock<HashMap<String, Arc<ProviderState>>>>,
    registry: Option<Arc<SandcastleMetrics>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("strategy", &self.strategy)
            .field("providers", &self.providers.read().len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a limiter that reports into the metrics registry
    pub fn with_metrics(config: RateLimiterConfig, metrics: Arc<SandcastleMetrics>) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: RateLimiterConfig, registry: Option<Arc<SandcastleMetrics>>) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|(name, budget)| {
                (
                    name.clone(),
                    Arc::new(ProviderState::new(name, *budget, registry.clone())),
                )
            })
            .collect();

        Self {
            strategy: config.strategy,
            default_budget: config.default_budget,
            providers: Arc::new(RwLock::new(providers)),
            registry,
        }
    }

    pub fn strategy(&self) -> AdmissionStrategy {
        self.strategy
    }

    /// Set or change a provider's budget
    ///
    /// An existing provider is resized in place: counters carry over and
    /// calls already in flight count against the new budget.
    pub fn configure_provider(&self, provider: &str, budget: ProviderBudget) -> Result<()> {
        if budget.max_concurrent == 0 {
            return Err(SandboxError::Config(format!(
                "provider '{}' needs max_concurrent of at least 1",
                provider
            )));
        }

        let mut providers = self.providers.write();
        match providers.get(provider) {
            Some(state) => state.resize(budget),
            None => {
                providers.insert(
                    provider.to_string(),
                    Arc::new(ProviderState::new(provider, budget, self.registry.clone())),
                );
            }
        }
        tracing::info!(
            provider,
            max_concurrent = budget.max_concurrent,
            timeout = ?budget.timeout,
            "Configured provider budget"
        );
        Ok(())
    }

    pub fn budget(&self, provider: &str) -> Option<ProviderBudget> {
        self.providers.read().get(provider).map(|s| s.budget())
    }

    fn provider_state(&self, provider: &str) -> Arc<ProviderState> {
        if let Some(state) = self.providers.read().get(provider) {
            return state.clone();
        }

        let mut providers = self.providers.write();
        // Double-check after acquiring the write lock
        providers
            .entry(provider.to_string())
            .or_insert_with(|| {
                tracing::debug!(
                    provider,
                    max_concurrent = self.default_budget.max_concurrent,
                    "Seeding unknown provider with default budget"
                );
                Arc::new(ProviderState::new(
                    provider,
                    self.default_budget,
                    self.registry.clone(),
                ))
            })
            .clone()
    }

    /// Ask for a call slot for `provider`
    pub async fn acquire(&self, provider: &str) -> Admission {
        let state = self.provider_state(provider);

        match state.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                state.update(|c| {
                    c.active_requests += 1;
                    c.total_accepted += 1;
                });
                return Admission::Immediate(state.admit(permit, Duration::ZERO));
            }
            Err(TryAcquireError::Closed) => {
                state.reject();
                return self.rejected(&state);
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        if self.strategy == AdmissionStrategy::Reject {
            state.reject();
            tracing::warn!(
                provider,
                max_concurrent = state.budget().max_concurrent,
                "Provider at capacity, rejecting call"
            );
            return self.rejected(&state);
        }

        let timeout = state.budget().timeout;
        let slot = QueueSlot::enter(&state);
        let started = Instant::now();
        tracing::debug!(provider, ?timeout, "Provider at capacity, queueing call");

        match tokio::time::timeout(timeout, state.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                slot.leave(|c| {
                    c.active_requests += 1;
                    c.total_accepted += 1;
                });
                let waited = started.elapsed();
                tracing::debug!(provider, ?waited, "Queued call admitted");
                Admission::Queued {
                    permit: state.admit(permit, waited),
                    waited,
                }
            }
            Ok(Err(_)) => {
                drop(slot);
                state.reject();
                self.rejected(&state)
            }
            Err(_) => {
                slot.leave(|c| c.total_rejected += 1);
                if let Some(registry) = &state.registry {
                    registry.record_rejection(&state.name);
                }
                tracing::warn!(provider, ?timeout, "Timed out waiting for a provider slot");
                Admission::TimedOut {
                    provider: provider.to_string(),
                    timeout,
                }
            }
        }
    }

    fn rejected(&self, state: &ProviderState) -> Admission {
        Admission::Rejected {
            provider: state.name.clone(),
            max_concurrent: state.budget().max_concurrent,
        }
    }

    /// Counters for one provider, if it has been seen
    pub fn metrics(&self, provider: &str) -> Option<ProviderMetrics> {
        self.providers
            .read()
            .get(provider)
            .map(|s| s.counters())
    }

    /// Counters for every known provider, sorted by name
    pub fn all_metrics(&self) -> BTreeMap<String, ProviderMetrics> {
        self.providers
            .read()
            .iter()
            .map(|(name, s)| (name.clone(), s.counters()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(strategy: AdmissionStrategy, max: usize, timeout: Duration) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            strategy,
            default_budget: ProviderBudget::default(),
            providers: HashMap::from([("anthropic".to_string(), ProviderBudget::new(max, timeout))]),
        })
    }

    async fn wait_for_queue(limiter: &RateLimiter, provider: &str, queued: usize) {
        for _ in 0..1000 {
            if limiter.metrics(provider).map(|m| m.queued_requests) == Some(queued) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reached {queued}");
    }

    #[tokio::test]
    async fn test_reject_at_capacity() {
        let limiter = limiter(AdmissionStrategy::Reject, 1, Duration::from_secs(60));

        let first = limiter.acquire("anthropic").await;
        assert!(matches!(first, Admission::Immediate(_)));
        let second = limiter.acquire("anthropic").await;
        assert!(matches!(
            second,
            Admission::Rejected { max_concurrent: 1, .. }
        ));

        let m = limiter.metrics("anthropic").unwrap();
        assert_eq!((m.active_requests, m.total_accepted, m.total_rejected), (1, 1, 1));

        drop(first);
        let m = limiter.metrics("anthropic").unwrap();
        assert_eq!((m.active_requests, m.total_completed), (0, 1));
        assert!(matches!(
            second.into_result(),
            Err(SandboxError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_queue_waits_for_release() {
        let limiter = limiter(AdmissionStrategy::Queue, 1, Duration::from_secs(60));
        let first = limiter.acquire("anthropic").await.into_result().unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("anthropic").await })
        };
        wait_for_queue(&limiter, "anthropic", 1).await;
        assert!(!waiter.is_finished());

        drop(first);
        let admission = waiter.await.unwrap();
        assert!(matches!(admission, Admission::Queued { .. }));

        let m = limiter.metrics("anthropic").unwrap();
        assert_eq!((m.active_requests, m.queued_requests, m.total_accepted), (1, 0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_counts_one_rejection() {
        let limiter = limiter(AdmissionStrategy::Queue, 1, Duration::from_millis(100));
        let _held = limiter.acquire("anthropic").await.into_result().unwrap();

        let admission = limiter.acquire("anthropic").await;
        match &admission {
            Admission::TimedOut { provider, timeout } => {
                assert_eq!(provider, "anthropic");
                assert_eq!(*timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected admission: {other:?}"),
        }

        let m = limiter.metrics("anthropic").unwrap();
        assert_eq!(m.total_rejected, 1);
        assert_eq!(m.queued_requests, 0);
        assert!(matches!(
            admission.into_result(),
            Err(SandboxError::QueueTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let limiter = limiter(AdmissionStrategy::Queue, 1, Duration::from_secs(60));
        let _held = limiter.acquire("anthropic").await.into_result().unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("anthropic").await })
        };
        wait_for_queue(&limiter, "anthropic", 1).await;

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(limiter.metrics("anthropic").unwrap().queued_requests, 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_gets_default_cap() {
        let limiter = limiter(AdmissionStrategy::Reject, 4, Duration::from_secs(60));
        assert!(limiter.metrics("openai").is_none());

        let _first = limiter.acquire("openai").await.into_result().unwrap();
        assert!(!limiter.acquire("openai").await.is_admitted());
        assert_eq!(limiter.budget("openai").unwrap().max_concurrent, 1);
        assert_eq!(limiter.all_metrics().len(), 2);
    }

    #[tokio::test]
    async fn test_configure_provider_keeps_totals() {
        let limiter = limiter(AdmissionStrategy::Reject, 1, Duration::from_secs(60));
        drop(limiter.acquire("anthropic").await);

        limiter
            .configure_provider("anthropic", ProviderBudget::new(2, Duration::from_secs(5)))
            .unwrap();
        let _a = limiter.acquire("anthropic").await.into_result().unwrap();
        let _b = limiter.acquire("anthropic").await.into_result().unwrap();

        let m = limiter.metrics("anthropic").unwrap();
        assert_eq!((m.total_accepted, m.total_completed, m.active_requests), (3, 1, 2));
    }

    #[tokio::test]
    async fn test_shrink_with_calls_in_flight() {
        let limiter = limiter(AdmissionStrategy::Reject, 2, Duration::from_secs(60));
        let a = limiter.acquire("anthropic").await.into_result().unwrap();
        let b = limiter.acquire("anthropic").await.into_result().unwrap();

        limiter
            .configure_provider("anthropic", ProviderBudget::new(1, Duration::from_secs(60)))
            .unwrap();
        assert!(!limiter.acquire("anthropic").await.is_admitted());

        // One call still in flight fills the new budget of one
        drop(a);
        assert!(!limiter.acquire("anthropic").await.is_admitted());

        drop(b);
        let c = limiter.acquire("anthropic").await.into_result().unwrap();
        assert!(!limiter.acquire("anthropic").await.is_admitted());
        drop(c);

        let m = limiter.metrics("anthropic").unwrap();
        assert_eq!(
            (m.total_accepted, m.total_completed, m.total_rejected, m.active_requests),
            (3, 3, 3, 0)
        );
    }

    #[tokio::test]
    async fn test_grow_cancels_pending_shrink() {
        let limiter = limiter(AdmissionStrategy::Reject, 2, Duration::from_secs(60));
        let a = limiter.acquire("anthropic").await.into_result().unwrap();
        let _b = limiter.acquire("anthropic").await.into_result().unwrap();

        limiter
            .configure_provider("anthropic", ProviderBudget::new(1, Duration::from_secs(60)))
            .unwrap();
        limiter
            .configure_provider("anthropic", ProviderBudget::new(3, Duration::from_secs(60)))
            .unwrap();

        let _c = limiter.acquire("anthropic").await.into_result().unwrap();
        assert!(!limiter.acquire("anthropic").await.is_admitted());

        drop(a);
        let _d = limiter.acquire("anthropic").await.into_result().unwrap();
        assert_eq!(limiter.metrics("anthropic").unwrap().active_requests, 3);
    }

    #[tokio::test]
    async fn test_configure_rejects_zero_budget() {
        let limiter = limiter(AdmissionStrategy::Reject, 1, Duration::from_secs(60));
        let err = limiter
            .configure_provider("anthropic", ProviderBudget::new(0, Duration::from_secs(60)))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
        assert_eq!(limiter.budget("anthropic").unwrap().max_concurrent, 1);
    }

    #[tokio::test]
    async fn test_reconfigured_provider_keeps_registry_gauge() {
        let registry = Arc::new(SandcastleMetrics::new().unwrap());
        let limiter = RateLimiter::with_metrics(
            RateLimiterConfig {
                strategy: AdmissionStrategy::Reject,
                ..RateLimiterConfig::default()
            },
            registry.clone(),
        );

        let held = limiter.acquire("openai").await.into_result().unwrap();
        limiter
            .configure_provider("openai", ProviderBudget::new(2, Duration::from_secs(5)))
            .unwrap();
        let second = limiter.acquire("openai").await.into_result().unwrap();
        assert_eq!(registry.rate_limit_active.with_label_values(&["openai"]).get(), 2);

        drop(held);
        assert_eq!(registry.rate_limit_active.with_label_values(&["openai"]).get(), 1);
        drop(second);
        assert_eq!(registry.rate_limit_completed_total.with_label_values(&["openai"]).get(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_active_never_exceeds_budget() {
        let limiter = limiter(AdmissionStrategy::Queue, 3, Duration::from_secs(30));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                let current = current.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _permit = limiter.acquire("anthropic").await.into_result().unwrap();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(limiter.metrics("anthropic").unwrap().active_requests <= 3);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let m = limiter.metrics("anthropic").unwrap();
        assert_eq!((m.total_accepted, m.total_completed, m.active_requests), (20, 20, 0));
    }

    #[tokio::test]
    async fn test_reports_into_registry() {
        let registry = Arc::new(SandcastleMetrics::new().unwrap());
        let limiter = RateLimiter::with_metrics(
            RateLimiterConfig {
                strategy: AdmissionStrategy::Reject,
                ..RateLimiterConfig::default()
            },
            registry.clone(),
        );

        let permit = limiter.acquire("openai").await.into_result().unwrap();
        assert_eq!(permit.provider(), "openai");
        assert!(!limiter.acquire("openai").await.is_admitted());
        assert_eq!(registry.rate_limit_active.with_label_values(&["openai"]).get(), 1);
        drop(permit);

        assert_eq!(registry.rate_limit_active.with_label_values(&["openai"]).get(), 0);
        assert_eq!(registry.rate_limit_accepted_total.with_label_values(&["openai"]).get(), 1);
        assert_eq!(registry.rate_limit_rejected_total.with_label_values(&["openai"]).get(), 1);
        assert_eq!(registry.rate_limit_completed_total.with_label_values(&["openai"]).get(), 1);
    }
}
