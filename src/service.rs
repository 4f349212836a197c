use crate::calendar::{CalendarWindow, CalendarWindowPilot, PeriodKey, ReportView};
use crate::config::{get_secret_key, AppConfig, CloudAccount};
use crate::error::AppError;
use crate::fetch::WindowFetcher;
use crate::limiter::{effective_rules, LimiterKey, LimiterSet, RateLimitedProvider};
use crate::models::PeriodBilling;
use crate::pipeline::{Pipeline, PipelineStep};
use crate::providers::{build_provider, Provider, QueryAccountBillRequest};
use crate::rollup::RollupStore;
use crate::stats::{CostAnalysis, StatisticsEngine};
use crate::utilization::{
    utilization_pipeline, UtilizationAnalysis, UtilizationContext, UtilizationEngine,
    UtilizationStore,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TRAILING_MONTHS: u32 = 24;
const RECENT_DAYS: u32 = 15;

/// Every window the cost dashboards read, in collection order.
pub fn report_views() -> Vec<ReportView> {
    vec![
        ReportView::TrailingMonths(TRAILING_MONTHS),
        ReportView::YearToDate,
        ReportView::PreviousYearToDate,
        ReportView::RecentDays(RECENT_DAYS),
        ReportView::PreviousYearRecentDays(RECENT_DAYS),
        ReportView::QuarterToDate,
        ReportView::PreviousQuarterToDate,
        ReportView::MonthToDate,
        ReportView::PreviousMonthToDate,
        ReportView::RecentDay,
        ReportView::PreviousDay,
    ]
}

/// Views fetched with product grouping before everything else.
pub fn detailed_views() -> [ReportView; 2] {
    [ReportView::RecentDay, ReportView::MonthToDate]
}

pub struct CostContext {
    pub pilot: CalendarWindowPilot,
    pub account: String,
    pub provider: Arc<dyn Provider>,
    pub fetcher: WindowFetcher,
    pub cancel: CancellationToken,
    pub store: Arc<RollupStore>,
    pub collected: CalendarWindow,
}

impl CostContext {
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
            store: Arc::new(RollupStore::new()),
            collected: CalendarWindow::default(),
        }
    }

    /// Fetches every key of `window` the store does not hold yet.
    async fn fetch_missing(
        &self,
        window: &CalendarWindow,
        group_by_product: bool,
    ) -> Result<usize, AppError> {
        let keys = self.store.missing(window);
        if keys.is_empty() {
            return Ok(0);
        }
        let provider = self.provider.clone();
        let account = self.account.clone();
        let records = self
            .fetcher
            .fetch_all(keys, &self.cancel, move |period: PeriodKey| {
                let provider = provider.clone();
                let account = account.clone();
                async move {
                    let request = QueryAccountBillRequest::for_period(period, group_by_product);
                    let bill = provider.query_account_bill(&request).await?;
                    Ok(PeriodBilling::from_account_bill(
                        period,
                        provider.provider_type(),
                        &account,
                        bill,
                    ))
                }
            })
            .await?;
        let mut stored = 0;
        for (_, record) in records {
            if self.store.load_if_absent(record) {
                stored += 1;
            }
        }
        Ok(stored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CostStep {
    Collect(ReportView),
    FetchDetailed(ReportView),
    FillCollected,
}

#[async_trait]
impl PipelineStep<CostContext> for CostStep {
    fn name(&self) -> String {
        match self {
            CostStep::Collect(view) => format!("collect:{}", view.label()),
            CostStep::FetchDetailed(view) => format!("fetch-detailed:{}", view.label()),
            CostStep::FillCollected => "fill-collected".into(),
        }
    }

    async fn run(&self, ctx: &mut CostContext) -> Result<(), AppError> {
        match *self {
            CostStep::Collect(view) => {
                ctx.collected = ctx.collected.union(&view.window(&ctx.pilot));
                Ok(())
            }
            CostStep::FetchDetailed(view) => {
                let stored = ctx.fetch_missing(&view.window(&ctx.pilot), true).await?;
                debug!(account = %ctx.account, view = %view.label(), stored, "detailed periods stored");
                Ok(())
            }
            CostStep::FillCollected => {
                let collected = ctx.collected.clone();
                let stored = ctx.fetch_missing(&collected, false).await?;
                debug!(account = %ctx.account, stored, "collected periods stored");
                Ok(())
            }
        }
    }
}

pub fn cost_pipeline() -> Pipeline<CostContext> {
    let mut pipeline = Pipeline::new("cost");
    for view in report_views() {
        pipeline = pipeline.step(CostStep::Collect(view));
    }
    for view in detailed_views() {
        pipeline = pipeline.step(CostStep::FetchDetailed(view));
    }
    pipeline.step(CostStep::FillCollected)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub cost_analysis_by_day: CostAnalysis,
    pub cost_analysis_by_month: CostAnalysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization: Option<UtilizationAnalysis>,
    pub days: BTreeMap<String, PeriodBilling>,
    pub months: BTreeMap<String, PeriodBilling>,
}

pub struct ReportService {
    config: AppConfig,
    limiters: LimiterSet,
    rules: HashMap<LimiterKey, u32>,
    fetcher: WindowFetcher,
}

impl ReportService {
    pub fn new(config: AppConfig) -> Self {
        let rules = effective_rules(&config.rate_limits);
        let fetcher = WindowFetcher::new(config.fetch.pacing_every, config.fetch.pacing_delay());
        Self {
            config,
            limiters: LimiterSet::new(),
            rules,
            fetcher,
        }
    }

    /// The account's provider behind the shared rate limiters.
    pub fn provider_for(&self, account: &CloudAccount) -> Result<Arc<dyn Provider>, AppError> {
        let secret = match account.fixture {
            Some(_) => None,
            None => Some(get_secret_key(account)?),
        };
        let inner = build_provider(account, secret)?;
        Ok(Arc::new(RateLimitedProvider::new(
            inner,
            &self.limiters,
            &self.rules,
        )))
    }

    pub async fn run(
        &self,
        pilot: CalendarWindowPilot,
        include_utilization: bool,
    ) -> Result<Dashboard, AppError> {
        if self.config.accounts.is_empty() {
            return Err(AppError::Config(
                "No accounts configured. Run add-account first.".into(),
            ));
        }
        let mut providers = Vec::with_capacity(self.config.accounts.len());
        for account in &self.config.accounts {
            providers.push((account.name.clone(), self.provider_for(account)?));
        }
        self.run_with_providers(pilot, providers, include_utilization)
            .await
    }

    /// Runs the pipelines for each `(account, provider)` pair and combines
    /// the account stores.
    pub async fn run_with_providers(
        &self,
        pilot: CalendarWindowPilot,
        providers: Vec<(String, Arc<dyn Provider>)>,
        include_utilization: bool,
    ) -> Result<Dashboard, AppError> {
        let cancel = CancellationToken::new();
        let combined = RollupStore::new();
        let utilization = UtilizationStore::new();

        for (account, provider) in providers {
            let mut ctx = CostContext::new(
                pilot,
                &account,
                provider.clone(),
                self.fetcher,
                cancel.child_token(),
            );
            cost_pipeline().run(&mut ctx).await?;
            combined.absorb(&ctx.store)?;
            info!(account = %account, records = ctx.store.len(), "account rolled up");

            if include_utilization {
                let mut ctx = UtilizationContext::new(
                    pilot,
                    &account,
                    provider,
                    self.fetcher,
                    cancel.child_token(),
                );
                utilization_pipeline().run(&mut ctx).await?;
                utilization.absorb(&ctx.store)?;
            }
        }

        let engine = StatisticsEngine::new(&combined, pilot);
        let snapshot = combined.snapshot();
        Ok(Dashboard {
            cost_analysis_by_day: engine.day_analysis(),
            cost_analysis_by_month: engine.month_analysis(),
            utilization: include_utilization
                .then(|| UtilizationEngine::new(&utilization, pilot).analysis()),
            days: snapshot.days,
            months: snapshot.months,
        })
    }
}
