//! Scriptable in-memory provider for unit tests.

use crate::calendar::{parse_day, PeriodKey};
use crate::error::AppError;
use crate::models::SubscriptionType;
use crate::providers::{
    AccountBill, AccountBillItem, CloudProvider, DescribeMetricListRequest, InstanceDetail,
    MetricName, MetricSample, Provider, QueryAccountBillRequest, Region,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct MockProvider {
    provider: CloudProvider,
    bills: HashMap<PeriodKey, AccountBill>,
    default_amount: Option<Decimal>,
    failing: HashSet<PeriodKey>,
    metrics: HashMap<(NaiveDate, MetricName), Vec<MetricSample>>,
    regions: Vec<Region>,
    instances: Vec<InstanceDetail>,
    delay: Option<Duration>,
    bill_calls: AtomicUsize,
    metric_calls: AtomicUsize,
    calls_per_period: Mutex<HashMap<PeriodKey, usize>>,
    grouped_requests: AtomicUsize,
}

impl MockProvider {
    pub fn new(provider: CloudProvider) -> Self {
        Self {
            provider,
            bills: HashMap::new(),
            default_amount: None,
            failing: HashSet::new(),
            metrics: HashMap::new(),
            regions: Vec::new(),
            instances: Vec::new(),
            delay: None,
            bill_calls: AtomicUsize::new(0),
            metric_calls: AtomicUsize::new(0),
            calls_per_period: Mutex::new(HashMap::new()),
            grouped_requests: AtomicUsize::new(0),
        }
    }

    pub fn key(raw: &str) -> PeriodKey {
        raw.parse().expect("valid period key")
    }

    /// Every period without an explicit bill returns one `ecs` line item.
    pub fn with_default_amount(mut self, amount: &str) -> Self {
        self.default_amount = Some(amount.parse().expect("decimal"));
        self
    }

    pub fn with_bill(mut self, period: &str, code: &str, name: &str, amount: &str) -> Self {
        self.bills
            .entry(Self::key(period))
            .or_default()
            .items
            .push(item(code, name, SubscriptionType::PostPaid, amount));
        self
    }

    pub fn failing_on(mut self, period: &str) -> Self {
        self.failing.insert(Self::key(period));
        self
    }

    pub fn with_metric(mut self, day: &str, metric: MetricName, instance: &str, value: f64) -> Self {
        self.metrics
            .entry((parse_day(day).expect("day"), metric))
            .or_default()
            .push(MetricSample {
                instance_id: instance.into(),
                average: value,
            });
        self
    }

    pub fn with_region(mut self, id: &str, name: &str) -> Self {
        self.regions.push(Region {
            region_id: id.into(),
            region_name: name.into(),
        });
        self
    }

    pub fn with_instance(mut self, id: &str, region: &str, sub: SubscriptionType) -> Self {
        self.instances.push(InstanceDetail {
            provider: self.provider,
            instance_id: id.into(),
            region_id: region.into(),
            region_name: String::new(),
            subscription_type: sub,
        });
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn bill_calls(&self) -> usize {
        self.bill_calls.load(Ordering::SeqCst)
    }

    pub fn metric_calls(&self) -> usize {
        self.metric_calls.load(Ordering::SeqCst)
    }

    pub fn grouped_requests(&self) -> usize {
        self.grouped_requests.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, period: &str) -> usize {
        let calls = self.calls_per_period.lock().expect("calls lock");
        calls.get(&Self::key(period)).copied().unwrap_or(0)
    }

    pub fn max_calls_per_period(&self) -> usize {
        let calls = self.calls_per_period.lock().expect("calls lock");
        calls.values().copied().max().unwrap_or(0)
    }
}

pub fn item(code: &str, name: &str, sub: SubscriptionType, amount: &str) -> AccountBillItem {
    AccountBillItem {
        product_code: code.into(),
        product_name: name.into(),
        billing_date: None,
        subscription_type: sub,
        currency: "CNY".into(),
        pretax_amount: amount.parse().expect("decimal"),
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn provider_type(&self) -> CloudProvider {
        self.provider
    }

    async fn query_account_bill(
        &self,
        request: &QueryAccountBillRequest,
    ) -> Result<AccountBill, AppError> {
        let period = request
            .billing_date
            .unwrap_or(PeriodKey::Month(request.billing_cycle));
        self.bill_calls.fetch_add(1, Ordering::SeqCst);
        if request.group_by_product {
            self.grouped_requests.fetch_add(1, Ordering::SeqCst);
        }
        *self
            .calls_per_period
            .lock()
            .expect("calls lock")
            .entry(period)
            .or_default() += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&period) {
            return Err(AppError::Upstream {
                provider: self.provider.to_string(),
                operation: "QueryAccountBill",
                message: format!("scripted failure for {period}"),
            });
        }
        if let Some(bill) = self.bills.get(&period) {
            return Ok(bill.clone());
        }
        Ok(AccountBill {
            items: self
                .default_amount
                .map(|amount| vec![item("ecs", "ECS", SubscriptionType::PostPaid, &amount.to_string())])
                .unwrap_or_default(),
            ..AccountBill::default()
        })
    }

    async fn describe_metric_list(
        &self,
        request: &DescribeMetricListRequest,
    ) -> Result<Vec<MetricSample>, AppError> {
        self.metric_calls.fetch_add(1, Ordering::SeqCst);
        let samples = self
            .metrics
            .get(&(request.start.date(), request.metric))
            .cloned()
            .unwrap_or_default();
        Ok(samples
            .into_iter()
            .filter(|s| request.instance_ids.is_empty() || request.instance_ids.contains(&s.instance_id))
            .collect())
    }

    async fn describe_regions(&self) -> Result<Vec<Region>, AppError> {
        Ok(self.regions.clone())
    }

    async fn query_available_instances(
        &self,
        region_id: &str,
    ) -> Result<Vec<InstanceDetail>, AppError> {
        Ok(self
            .instances
            .iter()
            .filter(|i| i.region_id == region_id)
            .cloned()
            .collect())
    }

    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceDetail>, AppError> {
        Ok(self
            .instances
            .iter()
            .filter(|i| instance_ids.contains(&i.instance_id))
            .cloned()
            .collect())
    }
}
