use crate::calendar::{format_day, CalendarWindowPilot, ReportView};
use crate::error::AppError;
use crate::fetch::WindowFetcher;
use crate::pipeline::{Pipeline, PipelineStep};
use crate::providers::{
    CloudProvider, DescribeMetricListRequest, InstanceDetail, MetricName, Provider, Region,
};
use crate::rollup::{insert_if_absent, upsert_with, values};
use crate::stats::{
    ratio_string, RatioChart, RatioEntry, TooltipUnit, EMPTY_MID_VALUE, UNDEFINED_RATIO,
};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveTime};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const UNKNOWN_REGION: &str = "unknown";
const METRIC_PERIOD_SECONDS: u32 = 86_400;
const TREND_DAYS: u32 = 14;
const CPU_BUCKETS: [(&str, f64, f64); 5] = [
    ("0%~20%", 0.0, 20.0),
    ("20%~40%", 20.0, 40.0),
    ("40%~60%", 40.0, 60.0),
    ("60%~80%", 60.0, 80.0),
    ("80% and above", 80.0, f64::INFINITY),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtilizationSample {
    pub provider: CloudProvider,
    pub instance_id: String,
    pub value: f64,
}

/// One metric's samples for a day across the accounts in `accounts`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUtilization {
    pub day: NaiveDate,
    pub accounts: BTreeSet<String>,
    pub samples: Vec<UtilizationSample>,
}

impl DailyUtilization {
    pub fn new(day: NaiveDate, account: &str, samples: Vec<UtilizationSample>) -> Self {
        Self {
            day,
            accounts: BTreeSet::from([account.to_string()]),
            samples,
        }
    }

    pub fn merge_from(&mut self, incoming: DailyUtilization) -> Result<(), AppError> {
        if self.day != incoming.day {
            return Err(AppError::mismatch(
                format_day(self.day),
                format!("cannot merge utilization for {}", format_day(incoming.day)),
            ));
        }
        if let Some(account) = self.accounts.intersection(&incoming.accounts).next() {
            return Err(AppError::mismatch(
                format_day(self.day),
                format!("utilization of account '{account}' is already rolled up"),
            ));
        }
        self.accounts.extend(incoming.accounts);
        self.samples.extend(incoming.samples);
        Ok(())
    }
}

fn instance_key(detail: &InstanceDetail) -> String {
    format!("{}:{}", detail.provider, detail.instance_id)
}

/// Daily CPU and memory utilization plus yesterday's instance inventory.
#[derive(Debug, Default)]
pub struct UtilizationStore {
    cpu: DashMap<NaiveDate, DailyUtilization>,
    memory: DashMap<NaiveDate, DailyUtilization>,
    instances: DashMap<String, InstanceDetail>,
}

impl UtilizationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, metric: MetricName) -> &DashMap<NaiveDate, DailyUtilization> {
        match metric {
            MetricName::CpuUtilization => &self.cpu,
            MetricName::MemoryUtilization => &self.memory,
        }
    }

    pub fn daily(&self, metric: MetricName, day: NaiveDate) -> Option<DailyUtilization> {
        self.series(metric).get(&day).map(|r| r.value().clone())
    }

    pub fn missing_days(&self, metric: MetricName, days: &BTreeSet<NaiveDate>) -> Vec<NaiveDate> {
        let series = self.series(metric);
        days.iter().filter(|d| !series.contains_key(d)).copied().collect()
    }

    pub fn load_if_absent(&self, metric: MetricName, record: DailyUtilization) -> bool {
        insert_if_absent(self.series(metric), record.day, record)
    }

    pub fn merge(&self, metric: MetricName, record: DailyUtilization) -> Result<(), AppError> {
        upsert_with(self.series(metric), record.day, record, |existing, incoming| {
            existing.merge_from(incoming)
        })
    }

    pub fn add_instance(&self, detail: InstanceDetail) -> bool {
        insert_if_absent(&self.instances, instance_key(&detail), detail)
    }

    /// Yesterday's instances ordered by `provider:instance_id`.
    pub fn recent_instances(&self) -> Vec<InstanceDetail> {
        let mut entries = values(&self.instances);
        entries.sort_by_key(instance_key);
        entries
    }

    pub fn absorb(&self, other: &UtilizationStore) -> Result<(), AppError> {
        for metric in [MetricName::CpuUtilization, MetricName::MemoryUtilization] {
            for record in values(other.series(metric)) {
                self.merge(metric, record)?;
            }
        }
        for detail in values(&other.instances) {
            self.add_instance(detail);
        }
        Ok(())
    }
}

pub struct UtilizationContext {
    pub pilot: CalendarWindowPilot,
    pub account: String,
    pub provider: Arc<dyn Provider>,
    pub fetcher: WindowFetcher,
    pub cancel: CancellationToken,
    pub store: Arc<UtilizationStore>,
    pub regions: Vec<Region>,
    pub inventory: Vec<InstanceDetail>,
    pub collected: BTreeSet<NaiveDate>,
}

impl UtilizationContext {
    pub fn new(
        pilot: CalendarWindowPilot,
        account: &str,
        provider: Arc<dyn Provider>,
        fetcher: WindowFetcher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pilot,
            account: account.to_string(),
            provider,
            fetcher,
            cancel,
            store: Arc::new(UtilizationStore::new()),
            regions: Vec::new(),
            inventory: Vec::new(),
            collected: BTreeSet::new(),
        }
    }

    fn region_name(&self, region_id: &str) -> String {
        self.regions
            .iter()
            .find(|r| r.region_id == region_id)
            .map(|r| r.region_name.clone())
            .unwrap_or_else(|| UNKNOWN_REGION.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UtilizationStep {
    LoadRegions,
    DiscoverInstances,
    CollectDays(ReportView),
    FetchMetric(MetricName),
    ResolveRecentInstances,
}

impl UtilizationStep {
    async fn discover_instances(ctx: &mut UtilizationContext) -> Result<(), AppError> {
        if !ctx.provider.provider_type().needs_instance_inventory() {
            debug!(provider = %ctx.provider.provider_type(), "metrics need no inventory");
            return Ok(());
        }
        let provider = ctx.provider.clone();
        let regions = ctx.regions.iter().map(|r| r.region_id.clone());
        let found = ctx
            .fetcher
            .fetch_all(regions, &ctx.cancel, move |region: String| {
                let provider = provider.clone();
                async move { provider.query_available_instances(&region).await }
            })
            .await?;
        ctx.inventory = found.into_iter().flat_map(|(_, list)| list).collect();
        info!(account = %ctx.account, instances = ctx.inventory.len(), "instances discovered");
        Ok(())
    }

    async fn fetch_metric(ctx: &mut UtilizationContext, metric: MetricName) -> Result<(), AppError> {
        let days = ctx.store.missing_days(metric, &ctx.collected);
        let provider_type = ctx.provider.provider_type();

        if provider_type.needs_instance_inventory() && ctx.inventory.is_empty() {
            debug!(provider = %provider_type, "no instances, recording empty utilization");
            for day in days {
                ctx.store
                    .load_if_absent(metric, DailyUtilization::new(day, &ctx.account, Vec::new()));
            }
            return Ok(());
        }

        let instance_ids: Vec<String> = if provider_type.needs_instance_inventory() {
            ctx.inventory.iter().map(|i| i.instance_id.clone()).collect()
        } else {
            Vec::new()
        };
        let provider = ctx.provider.clone();
        let account = ctx.account.clone();
        let records = ctx
            .fetcher
            .fetch_all(days, &ctx.cancel, move |day: NaiveDate| {
                let provider = provider.clone();
                let account = account.clone();
                let instance_ids = instance_ids.clone();
                async move {
                    let start = day.and_time(NaiveTime::MIN);
                    let request = DescribeMetricListRequest {
                        metric,
                        period_seconds: METRIC_PERIOD_SECONDS,
                        start,
                        end: start + Duration::days(1),
                        instance_ids,
                    };
                    let samples = provider
                        .describe_metric_list(&request)
                        .await?
                        .into_iter()
                        .map(|s| UtilizationSample {
                            provider: provider_type,
                            instance_id: s.instance_id,
                            value: s.average,
                        })
                        .collect();
                    Ok(DailyUtilization::new(day, &account, samples))
                }
            })
            .await?;
        for (_, record) in records {
            ctx.store.load_if_absent(metric, record);
        }
        Ok(())
    }

    async fn resolve_recent_instances(ctx: &mut UtilizationContext) -> Result<(), AppError> {
        let yesterday = ctx.pilot.recent_day();
        let ids: BTreeSet<String> = ctx
            .store
            .daily(MetricName::CpuUtilization, yesterday)
            .map(|d| d.samples.into_iter().map(|s| s.instance_id).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = ids.into_iter().collect();
        let details = ctx.provider.describe_instances(&ids).await?;
        for mut detail in details {
            detail.region_name = ctx.region_name(&detail.region_id);
            ctx.store.add_instance(detail);
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStep<UtilizationContext> for UtilizationStep {
    fn name(&self) -> String {
        match self {
            UtilizationStep::LoadRegions => "load-regions".into(),
            UtilizationStep::DiscoverInstances => "discover-instances".into(),
            UtilizationStep::CollectDays(view) => format!("collect:{}", view.label()),
            UtilizationStep::FetchMetric(MetricName::CpuUtilization) => "fetch:cpu".into(),
            UtilizationStep::FetchMetric(MetricName::MemoryUtilization) => "fetch:memory".into(),
            UtilizationStep::ResolveRecentInstances => "resolve-recent-instances".into(),
        }
    }

    async fn run(&self, ctx: &mut UtilizationContext) -> Result<(), AppError> {
        match *self {
            UtilizationStep::LoadRegions => {
                ctx.regions = ctx.provider.describe_regions().await?;
                Ok(())
            }
            UtilizationStep::DiscoverInstances => Self::discover_instances(ctx).await,
            UtilizationStep::CollectDays(view) => {
                ctx.collected.extend(view.window(&ctx.pilot).days);
                Ok(())
            }
            UtilizationStep::FetchMetric(metric) => Self::fetch_metric(ctx, metric).await,
            UtilizationStep::ResolveRecentInstances => Self::resolve_recent_instances(ctx).await,
        }
    }
}

pub fn utilization_pipeline() -> Pipeline<UtilizationContext> {
    Pipeline::new("utilization")
        .step(UtilizationStep::LoadRegions)
        .step(UtilizationStep::DiscoverInstances)
        .step(UtilizationStep::CollectDays(ReportView::RecentDay))
        .step(UtilizationStep::CollectDays(ReportView::PreviousDay))
        .step(UtilizationStep::CollectDays(ReportView::RecentDays(TREND_DAYS)))
        .step(UtilizationStep::FetchMetric(MetricName::CpuUtilization))
        .step(UtilizationStep::FetchMetric(MetricName::MemoryUtilization))
        .step(UtilizationStep::ResolveRecentInstances)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtilizationRow {
    pub cycle: String,
    pub amount: String,
    pub unit: String,
    pub previous_cycle: String,
    pub previous_amount: String,
    pub previous_unit: String,
    pub ratio: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtilizationSeries {
    pub name: String,
    pub data: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtilizationChart {
    pub id: String,
    pub title: String,
    pub x_data: Vec<String>,
    pub series: Vec<UtilizationSeries>,
    pub y_title: Vec<String>,
    pub tooltip_unit: TooltipUnit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UtilizationAnalysis {
    pub view_type: String,
    pub data_cycle: String,
    pub statistics: Vec<UtilizationRow>,
    pub ratios: Vec<RatioChart>,
    pub cpu_trend: UtilizationChart,
    pub utilize_trend: UtilizationChart,
}

fn counted_chart(id: &str, title: &str, counts: BTreeMap<String, usize>) -> RatioChart {
    let total: usize = counts.values().sum();
    let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    RatioChart {
        id: id.to_string(),
        title: title.to_string(),
        mid_unit: "servers".to_string(),
        mid_value: if counts.is_empty() {
            EMPTY_MID_VALUE.to_string()
        } else {
            total.to_string()
        },
        data: counts
            .into_iter()
            .map(|(name, n)| RatioEntry {
                name,
                value: n.to_string(),
            })
            .collect(),
    }
}

pub struct UtilizationEngine<'a> {
    store: &'a UtilizationStore,
    pilot: CalendarWindowPilot,
}

impl<'a> UtilizationEngine<'a> {
    pub fn new(store: &'a UtilizationStore, pilot: CalendarWindowPilot) -> Self {
        Self { store, pilot }
    }

    fn samples(&self, metric: MetricName, day: NaiveDate) -> Vec<UtilizationSample> {
        self.store
            .daily(metric, day)
            .map(|d| d.samples)
            .unwrap_or_default()
    }

    /// Mean utilization of a day in percent, or `"--"` without samples.
    pub fn average(&self, metric: MetricName, day: NaiveDate) -> String {
        let samples = self.samples(metric, day);
        if samples.is_empty() {
            return UNDEFINED_RATIO.to_string();
        }
        let total: f64 = samples.iter().map(|s| s.value).sum();
        format!("{:.2}", total / samples.len() as f64)
    }

    pub fn server_count(&self, day: NaiveDate) -> usize {
        self.samples(MetricName::CpuUtilization, day).len()
    }

    pub fn statistics(&self) -> Vec<UtilizationRow> {
        let yesterday = self.pilot.recent_day();
        let before = self.pilot.previous_day();
        let row = |cycle: &str, amount: String, previous: String, unit: &str| UtilizationRow {
            cycle: cycle.to_string(),
            ratio: ratio_string(&previous, &amount),
            amount,
            unit: unit.to_string(),
            previous_cycle: "previous day".to_string(),
            previous_amount: previous,
            previous_unit: unit.to_string(),
        };
        vec![
            row(
                "Average CPU utilization",
                self.average(MetricName::CpuUtilization, yesterday),
                self.average(MetricName::CpuUtilization, before),
                "%",
            ),
            row(
                "Average memory utilization",
                self.average(MetricName::MemoryUtilization, yesterday),
                self.average(MetricName::MemoryUtilization, before),
                "%",
            ),
            row(
                "Cloud servers",
                self.server_count(yesterday).to_string(),
                self.server_count(before).to_string(),
                "servers",
            ),
        ]
    }

    pub fn ratio_charts(&self) -> Vec<RatioChart> {
        let instances = self.store.recent_instances();
        let mut by_subscription = BTreeMap::new();
        let mut by_provider = BTreeMap::new();
        let mut by_region = BTreeMap::new();
        for i in &instances {
            *by_subscription
                .entry(i.subscription_type.as_label().to_string())
                .or_insert(0) += 1;
            *by_provider.entry(i.provider.display_name().to_string()).or_insert(0) += 1;
            *by_region
                .entry(format!("{}-{}", i.provider.display_name(), i.region_name))
                .or_insert(0) += 1;
        }
        vec![
            counted_chart("chargeTypeRatio", "Servers by charge type", by_subscription),
            counted_chart("providerTypeRatio", "Servers by provider", by_provider),
            counted_chart("regionTypeRatio", "Servers by region", by_region),
        ]
    }

    fn trend_days(&self) -> Vec<NaiveDate> {
        self.pilot.recent_days(TREND_DAYS).days.into_iter().collect()
    }

    /// Servers per CPU utilization bucket and day. Days without any CPU
    /// data show `"--"`.
    pub fn cpu_distribution(&self) -> UtilizationChart {
        let days = self.trend_days();
        let per_day: Vec<Option<Vec<f64>>> = days
            .iter()
            .map(|d| {
                self.store
                    .daily(MetricName::CpuUtilization, *d)
                    .filter(|r| !r.samples.is_empty())
                    .map(|r| r.samples.iter().map(|s| s.value).collect())
            })
            .collect();
        let series = CPU_BUCKETS
            .iter()
            .map(|&(name, low, high)| UtilizationSeries {
                name: name.to_string(),
                data: per_day
                    .iter()
                    .map(|values| match values {
                        Some(values) => values
                            .iter()
                            .filter(|v| **v >= low && **v < high)
                            .count()
                            .to_string(),
                        None => UNDEFINED_RATIO.to_string(),
                    })
                    .collect(),
            })
            .collect();
        UtilizationChart {
            id: "cpuTrend".to_string(),
            title: "CPU utilization distribution".to_string(),
            x_data: days.iter().map(|d| format_day(*d)).collect(),
            series,
            y_title: vec!["Servers".to_string()],
            tooltip_unit: TooltipUnit {
                bar: "servers".to_string(),
                line: String::new(),
            },
            stack: Some("total".to_string()),
        }
    }

    pub fn utilization_trend(&self) -> UtilizationChart {
        let days = self.trend_days();
        let averages = |metric: MetricName| -> Vec<String> {
            days.iter().map(|d| self.average(metric, *d)).collect()
        };
        UtilizationChart {
            id: "utilizeTrend".to_string(),
            title: "Utilization trend".to_string(),
            x_data: days.iter().map(|d| format_day(*d)).collect(),
            series: vec![
                UtilizationSeries {
                    name: "CPU".to_string(),
                    data: averages(MetricName::CpuUtilization),
                },
                UtilizationSeries {
                    name: "Memory".to_string(),
                    data: averages(MetricName::MemoryUtilization),
                },
            ],
            y_title: vec!["Utilization (%)".to_string()],
            tooltip_unit: TooltipUnit {
                bar: String::new(),
                line: "%".to_string(),
            },
            stack: None,
        }
    }

    pub fn analysis(&self) -> UtilizationAnalysis {
        UtilizationAnalysis {
            view_type: "day".to_string(),
            data_cycle: format!("{} 23:59:59", format_day(self.pilot.recent_day())),
            statistics: self.statistics(),
            ratios: self.ratio_charts(),
            cpu_trend: self.cpu_distribution(),
            utilize_trend: self.utilization_trend(),
        }
    }
}
