use crate::calendar::MonthKey;
use crate::config::RateLimitRule;
use crate::error::AppError;
use crate::providers::{
    AccountBill, CloudProvider, DescribeMetricListRequest, InstanceBill, InstanceDetail,
    MetricSample, Operation, Provider, QueryAccountBillRequest, Region,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

pub type LimiterKey = (CloudProvider, Operation);

/// Token bucket without burst credit: calls are spaced at least
/// `1 / rate` apart no matter how long the limiter sat idle.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_second(rate: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / rate.max(1),
            last_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn reserve(&self) -> Instant {
        let mut last = self.last_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let slot = match *last {
            Some(prev) => now.max(prev + self.interval),
            None => now,
        };
        *last = Some(slot);
        slot
    }

    pub async fn acquire(&self) {
        let slot = self.reserve();
        sleep_until(slot).await;
    }
}

/// Lazily created limiters, one per provider operation.
#[derive(Debug, Default)]
pub struct LimiterSet {
    limiters: Mutex<HashMap<LimiterKey, Arc<RateLimiter>>>,
}

impl LimiterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the limiter for `key`, creating it at `rate` on first use.
    /// Later calls ignore `rate`.
    pub fn get_or_create(&self, key: LimiterKey, rate: u32) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        limiters
            .entry(key)
            .or_insert_with(|| {
                debug!(provider = %key.0, operation = key.1.as_str(), rate, "rate limiter created");
                Arc::new(RateLimiter::per_second(rate))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub fn default_rules() -> Vec<RateLimitRule> {
    vec![RateLimitRule {
        provider: CloudProvider::Tencent,
        operation: Operation::QueryAccountBill,
        per_second: 3,
    }]
}

/// Built-in rules overlaid with configured ones; a configured rule replaces
/// the built-in rule for the same operation.
pub fn effective_rules(configured: &[RateLimitRule]) -> HashMap<LimiterKey, u32> {
    default_rules()
        .iter()
        .chain(configured)
        .map(|rule| ((rule.provider, rule.operation), rule.per_second))
        .collect()
}

/// Wraps a provider so every rate-limited operation waits for its slot.
pub struct RateLimitedProvider {
    inner: Arc<dyn Provider>,
    limiters: HashMap<Operation, Arc<RateLimiter>>,
}

impl RateLimitedProvider {
    pub fn new(
        inner: Arc<dyn Provider>,
        set: &LimiterSet,
        rules: &HashMap<LimiterKey, u32>,
    ) -> Self {
        let provider = inner.provider_type();
        let limiters = rules
            .iter()
            .filter(|((p, _), _)| *p == provider)
            .map(|(&(p, op), &rate)| (op, set.get_or_create((p, op), rate)))
            .collect();
        Self { inner, limiters }
    }

    async fn throttle(&self, operation: Operation) {
        if let Some(limiter) = self.limiters.get(&operation) {
            limiter.acquire().await;
        }
    }
}

#[async_trait]
impl Provider for RateLimitedProvider {
    fn provider_type(&self) -> CloudProvider {
        self.inner.provider_type()
    }

    async fn query_account_bill(
        &self,
        request: &QueryAccountBillRequest,
    ) -> Result<AccountBill, AppError> {
        self.throttle(Operation::QueryAccountBill).await;
        self.inner.query_account_bill(request).await
    }

    async fn describe_metric_list(
        &self,
        request: &DescribeMetricListRequest,
    ) -> Result<Vec<MetricSample>, AppError> {
        self.throttle(Operation::DescribeMetricList).await;
        self.inner.describe_metric_list(request).await
    }

    async fn describe_regions(&self) -> Result<Vec<Region>, AppError> {
        self.throttle(Operation::DescribeRegions).await;
        self.inner.describe_regions().await
    }

    async fn query_available_instances(
        &self,
        region_id: &str,
    ) -> Result<Vec<InstanceDetail>, AppError> {
        self.throttle(Operation::QueryAvailableInstances).await;
        self.inner.query_available_instances(region_id).await
    }

    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceDetail>, AppError> {
        self.throttle(Operation::DescribeInstances).await;
        self.inner.describe_instances(instance_ids).await
    }

    async fn describe_instance_bill(
        &self,
        billing_cycle: MonthKey,
        instance_id: Option<&str>,
    ) -> Result<Vec<InstanceBill>, AppError> {
        self.throttle(Operation::DescribeInstanceBill).await;
        self.inner
            .describe_instance_bill(billing_cycle, instance_id)
            .await
    }
}
