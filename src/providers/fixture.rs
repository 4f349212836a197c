use crate::calendar::{format_day, MonthKey, PeriodKey};
use crate::error::AppError;
use crate::providers::{
    AccountBill, CloudProvider, DescribeMetricListRequest, InstanceBill, InstanceDetail,
    MetricName, MetricSample, Provider, QueryAccountBillRequest, Region,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Recorded provider responses, loaded from a JSON file.
///
/// Bills are keyed by period (`YYYY-MM-DD` or `YYYY-MM`); periods without an
/// entry replay as an empty bill. Metrics are keyed by day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDataset {
    #[serde(default)]
    pub bills: BTreeMap<PeriodKey, AccountBill>,
    #[serde(default)]
    pub metrics: BTreeMap<String, FixtureMetrics>,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub instances: Vec<InstanceDetail>,
    #[serde(default)]
    pub instance_bills: BTreeMap<MonthKey, Vec<InstanceBill>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureMetrics {
    #[serde(default)]
    pub cpu_utilization: Vec<MetricSample>,
    #[serde(default)]
    pub memory_utilization: Vec<MetricSample>,
}

pub struct FixtureProvider {
    provider: CloudProvider,
    dataset: FixtureDataset,
}

impl FixtureProvider {
    pub fn new(provider: CloudProvider, dataset: FixtureDataset) -> Self {
        Self { provider, dataset }
    }

    pub fn load(provider: CloudProvider, path: &Path) -> Result<Self, AppError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("cannot read fixture {}: {err}", path.display()))
        })?;
        let dataset: FixtureDataset = serde_json::from_str(&raw)?;
        debug!(
            provider = %provider,
            path = %path.display(),
            bills = dataset.bills.len(),
            "fixture dataset loaded"
        );
        Ok(Self::new(provider, dataset))
    }
}

fn filter_ids<'a>(
    samples: &'a [MetricSample],
    ids: &'a [String],
) -> impl Iterator<Item = &'a MetricSample> + 'a {
    samples
        .iter()
        .filter(move |s| ids.is_empty() || ids.contains(&s.instance_id))
}

#[async_trait]
impl Provider for FixtureProvider {
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
        Ok(self.dataset.bills.get(&period).cloned().unwrap_or_default())
    }

    async fn describe_metric_list(
        &self,
        request: &DescribeMetricListRequest,
    ) -> Result<Vec<MetricSample>, AppError> {
        let day = format_day(request.start.date());
        let Some(metrics) = self.dataset.metrics.get(&day) else {
            return Ok(Vec::new());
        };
        let samples = match request.metric {
            MetricName::CpuUtilization => &metrics.cpu_utilization,
            MetricName::MemoryUtilization => &metrics.memory_utilization,
        };
        Ok(filter_ids(samples, &request.instance_ids).cloned().collect())
    }

    async fn describe_regions(&self) -> Result<Vec<Region>, AppError> {
        Ok(self.dataset.regions.clone())
    }

    async fn query_available_instances(
        &self,
        region_id: &str,
    ) -> Result<Vec<InstanceDetail>, AppError> {
        Ok(self
            .dataset
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
            .dataset
            .instances
            .iter()
            .filter(|i| instance_ids.contains(&i.instance_id))
            .cloned()
            .collect())
    }

    async fn describe_instance_bill(
        &self,
        billing_cycle: MonthKey,
        instance_id: Option<&str>,
    ) -> Result<Vec<InstanceBill>, AppError> {
        let rows = self
            .dataset
            .instance_bills
            .get(&billing_cycle)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(rows
            .iter()
            .filter(|b| instance_id.map_or(true, |id| b.instance_id == id))
            .cloned()
            .collect())
    }
}
