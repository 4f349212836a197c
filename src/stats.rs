use crate::calendar::{
    add_months, format_day, CalendarWindow, CalendarWindowPilot, MonthKey, PeriodKey,
    PeriodKind, ReportView,
};
use crate::models::PeriodBilling;
use crate::rollup::RollupStore;
use chrono::Duration;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

pub const UNDEFINED_RATIO: &str = "--";
pub const EMPTY_MID_VALUE: &str = "-";

/// Product codes whose line items make up the server charge-type breakdown.
const COMPUTE_PRODUCTS: [&str; 3] = ["ecs", "p_cvm", "EC2 - Other"];

const TREND_DAYS: u32 = 14;
const TREND_PERIODS: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ratio {
    /// Relative change in percent, already rounded to two places.
    Percent(Decimal),
    Undefined,
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ratio::Percent(value) => write!(f, "{value:.2}"),
            Ratio::Undefined => f.write_str(UNDEFINED_RATIO),
        }
    }
}

/// `(current - baseline) / |baseline|` rounded to four places, in percent.
pub fn ratio(baseline: Decimal, current: Decimal) -> Ratio {
    if baseline.is_zero() {
        return Ratio::Undefined;
    }
    let Some(change) = (current - baseline).checked_div(baseline.abs()) else {
        return Ratio::Undefined;
    };
    let percent = change.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
        * Decimal::ONE_HUNDRED;
    if percent.is_zero() {
        Ratio::Percent(Decimal::ZERO)
    } else {
        Ratio::Percent(percent)
    }
}

/// String form of [`ratio`]. A side that is not a number (for example a
/// `"--"` from an earlier ratio) yields `"--"`.
pub fn ratio_string(baseline: &str, current: &str) -> String {
    match (baseline.trim().parse::<Decimal>(), current.trim().parse::<Decimal>()) {
        (Ok(baseline), Ok(current)) => ratio(baseline, current).to_string(),
        _ => UNDEFINED_RATIO.to_string(),
    }
}

pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

pub fn currency_unit(currency: &str) -> &'static str {
    match currency {
        "USD" => "$",
        "CNY" => "¥",
        _ => "",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Product,
    Provider,
    ChargeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RatioEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatioChart {
    pub id: String,
    pub title: String,
    pub mid_unit: String,
    pub mid_value: String,
    pub data: Vec<RatioEntry>,
}

impl RatioChart {
    pub fn new(id: &str, title: &str, unit: &str, data: Vec<RatioEntry>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            mid_unit: unit.to_string(),
            mid_value: mid_value(&data),
            data,
        }
    }
}

/// Sum of a chart's values, or `"-"` for an empty chart.
pub fn mid_value(entries: &[RatioEntry]) -> String {
    if entries.is_empty() {
        return EMPTY_MID_VALUE.to_string();
    }
    let sum: Decimal = entries
        .iter()
        .filter_map(|e| e.value.parse::<Decimal>().ok())
        .sum();
    format_amount(sum)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticRow {
    pub cycle: String,
    pub amount: String,
    pub previous_cycle: String,
    pub previous_amount: String,
    pub ratio: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSeries {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub y_axis_index: u8,
    pub data: Vec<String>,
}

impl TrendSeries {
    fn bars(name: &str, data: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            kind: "bar".to_string(),
            y_axis_index: 0,
            data,
        }
    }

    fn line(name: &str, data: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            kind: "line".to_string(),
            y_axis_index: 1,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TooltipUnit {
    pub bar: String,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendChart {
    pub id: String,
    pub title: String,
    pub x_data: Vec<String>,
    pub series: Vec<TrendSeries>,
    pub y_title: Vec<String>,
    pub tooltip_unit: TooltipUnit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAnalysis {
    pub view_type: String,
    pub data_cycle: String,
    pub statistics: Vec<StatisticRow>,
    pub ratios: Vec<RatioChart>,
    pub cost_trend: TrendChart,
}

/// One point of a trend: the period's amount, last year's amount for the
/// same period, and the amount of the period right before it.
struct TrendPoint {
    label: String,
    current: Decimal,
    previous_year: Decimal,
    previous_period: Decimal,
}

/// Read-only statistics over a combined rollup store.
pub struct StatisticsEngine<'a> {
    store: &'a RollupStore,
    pilot: CalendarWindowPilot,
}

impl<'a> StatisticsEngine<'a> {
    pub fn new(store: &'a RollupStore, pilot: CalendarWindowPilot) -> Self {
        Self { store, pilot }
    }

    fn records(&self, window: &CalendarWindow) -> Vec<PeriodBilling> {
        window.periods().filter_map(|k| self.store.lookup(k)).collect()
    }

    fn key_total(&self, key: PeriodKey) -> Decimal {
        self.store
            .lookup(key)
            .map(|r| r.total_amount)
            .unwrap_or_default()
    }

    /// Sum over every key of `window`; keys without a record add zero.
    pub fn period_total(&self, window: &CalendarWindow) -> Decimal {
        window.periods().map(|k| self.key_total(k)).sum()
    }

    /// Buckets of `window` for `dimension`, largest first. Buckets without
    /// any entry are omitted.
    pub fn composition_ratios(&self, window: &CalendarWindow, dimension: Dimension) -> Vec<RatioEntry> {
        let mut buckets: BTreeMap<String, Decimal> = BTreeMap::new();
        for record in self.records(window) {
            match dimension {
                Dimension::Product => {
                    for product in record.products.values() {
                        *buckets.entry(product.product_name.clone()).or_default() +=
                            product.total_amount;
                    }
                }
                Dimension::Provider => {
                    for (provider, amount) in &record.provider_totals {
                        *buckets.entry(provider.display_name().to_string()).or_default() += *amount;
                    }
                }
                Dimension::ChargeType => {
                    for (code, product) in &record.products {
                        if !COMPUTE_PRODUCTS.contains(&code.as_str()) {
                            continue;
                        }
                        for item in &product.items {
                            *buckets
                                .entry(item.subscription_type.as_label().to_string())
                                .or_default() += item.amount;
                        }
                    }
                }
            }
        }

        let mut entries: Vec<(String, Decimal)> = buckets.into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries
            .into_iter()
            .map(|(name, amount)| RatioEntry {
                name,
                value: format_amount(amount),
            })
            .collect()
    }

    fn statistic_row(
        &self,
        cycle: String,
        current: &CalendarWindow,
        previous_cycle: &str,
        previous: &CalendarWindow,
    ) -> StatisticRow {
        let amount = self.period_total(current);
        let previous_amount = self.period_total(previous);
        StatisticRow {
            cycle,
            amount: format_amount(amount),
            previous_cycle: previous_cycle.to_string(),
            previous_amount: format_amount(previous_amount),
            ratio: ratio(previous_amount, amount).to_string(),
        }
    }

    /// Yesterday, month, quarter and year to date, each against the same
    /// span of the preceding period.
    pub fn statistics(&self) -> Vec<StatisticRow> {
        let p = &self.pilot;
        let yesterday = p.recent_day();
        vec![
            self.statistic_row(
                format!("{} total", format_day(yesterday)),
                &ReportView::RecentDay.window(p),
                "previous day",
                &ReportView::PreviousDay.window(p),
            ),
            self.statistic_row(
                format!("{} to date", MonthKey::of(yesterday)),
                &ReportView::MonthToDate.window(p),
                "previous month, same period",
                &ReportView::PreviousMonthToDate.window(p),
            ),
            self.statistic_row(
                format!("{} Q{} to date", p.recent_year(), p.recent_quarter()),
                &ReportView::QuarterToDate.window(p),
                "previous quarter, same period",
                &ReportView::PreviousQuarterToDate.window(p),
            ),
            self.statistic_row(
                format!("{} to date", p.recent_year()),
                &ReportView::YearToDate.window(p),
                "previous year, same period",
                &ReportView::PreviousYearToDate.window(p),
            ),
        ]
    }

    fn day_points(&self) -> Vec<TrendPoint> {
        self.pilot
            .recent_days(TREND_DAYS)
            .days
            .iter()
            .map(|&day| TrendPoint {
                label: format_day(day),
                current: self.key_total(PeriodKey::Day(day)),
                previous_year: self.key_total(PeriodKey::Day(add_months(day, -12))),
                previous_period: self.key_total(PeriodKey::Day(day - Duration::days(1))),
            })
            .collect()
    }

    fn month_points(&self) -> Vec<TrendPoint> {
        let window = self.pilot.trailing_periods(TREND_PERIODS);
        let mut points: Vec<TrendPoint> = window
            .months
            .iter()
            .map(|&month| TrendPoint {
                label: month.to_string(),
                current: self.key_total(PeriodKey::Month(month)),
                previous_year: self.key_total(PeriodKey::Month(month.add_months(-12))),
                previous_period: self.key_total(PeriodKey::Month(month.add_months(-1))),
            })
            .collect();

        if let Some(first) = window.days.first() {
            let partial = CalendarWindow::from_days(window.days.iter().copied());
            let month = MonthKey::of(*first);
            points.push(TrendPoint {
                label: month.to_string(),
                current: self.period_total(&partial),
                previous_year: self.period_total(&self.pilot.shift_to_previous_year(&partial)),
                previous_period: self.key_total(PeriodKey::Month(month.add_months(-1))),
            });
        }
        points
    }

    fn trend_chart(&self, points: Vec<TrendPoint>, chain_label: &str) -> TrendChart {
        let unit = self.currency_unit();
        TrendChart {
            id: "costTrend".to_string(),
            title: "Cost trend".to_string(),
            x_data: points.iter().map(|p| p.label.clone()).collect(),
            series: vec![
                TrendSeries::bars(
                    "Cost (current period)",
                    points.iter().map(|p| format_amount(p.current)).collect(),
                ),
                TrendSeries::bars(
                    "Cost (same period last year)",
                    points.iter().map(|p| format_amount(p.previous_year)).collect(),
                ),
                TrendSeries::line(
                    chain_label,
                    points
                        .iter()
                        .map(|p| ratio(p.previous_period, p.current).to_string())
                        .collect(),
                ),
                TrendSeries::line(
                    "Year on year",
                    points
                        .iter()
                        .map(|p| ratio(p.previous_year, p.current).to_string())
                        .collect(),
                ),
            ],
            y_title: vec![format!("Cost ({unit})"), "Change (%)".to_string()],
            tooltip_unit: TooltipUnit {
                bar: unit.to_string(),
                line: "%".to_string(),
            },
        }
    }

    /// Daily costs of the last 14 days with chain and year-on-year ratios.
    pub fn day_trend(&self) -> TrendChart {
        self.trend_chart(self.day_points(), "Day on day")
    }

    /// The 12 trailing periods; the newest one is the partial current month
    /// unless today is the 1st.
    pub fn month_trend(&self) -> TrendChart {
        self.trend_chart(self.month_points(), "Month on month")
    }

    /// Currency symbol of the first line item found, days before months.
    pub fn currency_unit(&self) -> &'static str {
        let snapshot = self.store.snapshot();
        snapshot
            .days
            .values()
            .chain(snapshot.months.values())
            .find_map(PeriodBilling::currency)
            .map(currency_unit)
            .unwrap_or("")
    }

    fn ratio_charts(&self, window: &CalendarWindow, span: &str) -> Vec<RatioChart> {
        let unit = self.currency_unit();
        vec![
            RatioChart::new(
                "productTypeRatio",
                &format!("{span} cost by product"),
                unit,
                self.composition_ratios(window, Dimension::Product),
            ),
            RatioChart::new(
                "providerTypeRatio",
                &format!("{span} cost by provider"),
                unit,
                self.composition_ratios(window, Dimension::Provider),
            ),
            RatioChart::new(
                "chargeTypeRatio",
                &format!("{span} server cost by charge type"),
                unit,
                self.composition_ratios(window, Dimension::ChargeType),
            ),
        ]
    }

    fn data_cycle(&self) -> String {
        format!("{} 23:59:59", format_day(self.pilot.recent_day()))
    }

    pub fn day_analysis(&self) -> CostAnalysis {
        CostAnalysis {
            view_type: "day".to_string(),
            data_cycle: self.data_cycle(),
            statistics: self.statistics(),
            ratios: self.ratio_charts(&ReportView::RecentDay.window(&self.pilot), "Daily"),
            cost_trend: self.day_trend(),
        }
    }

    pub fn month_analysis(&self) -> CostAnalysis {
        CostAnalysis {
            view_type: "month".to_string(),
            data_cycle: self.data_cycle(),
            statistics: self.statistics(),
            ratios: self.ratio_charts(&self.pilot.period_to_date(PeriodKind::Month), "Monthly"),
            cost_trend: self.month_trend(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::parse_day;
    use crate::models::SubscriptionType;
    use crate::providers::testing::item;
    use crate::providers::{AccountBill, AccountBillItem, CloudProvider};

    fn load(
        store: &RollupStore,
        period: &str,
        provider: CloudProvider,
        account: &str,
        rows: Vec<AccountBillItem>,
    ) {
        let record = PeriodBilling::from_account_bill(
            period.parse().expect("period"),
            provider,
            account,
            AccountBill {
                items: rows,
                ..AccountBill::default()
            },
        );
        store.merge(record).expect("merge");
    }

    fn ecs(amount: &str) -> Vec<AccountBillItem> {
        vec![item("ecs", "ECS", SubscriptionType::PostPaid, amount)]
    }

    fn pilot() -> CalendarWindowPilot {
        CalendarWindowPilot::new(parse_day("2022-03-11").expect("day"))
    }

    #[test]
    fn ratio_string_handles_baselines() {
        assert_eq!(ratio_string("0", "5"), "--");
        assert_eq!(ratio_string("0.00", "0.00"), "--");
        assert_eq!(ratio_string("20.00", "30.00"), "50.00");
        assert_eq!(ratio_string("20", "10"), "-50.00");
        assert_eq!(ratio_string("3", "1"), "-66.67");
        assert_eq!(ratio_string("-10", "-5"), "50.00");
        assert_eq!(ratio_string("7", "7"), "0.00");
    }

    #[test]
    fn undefined_ratio_propagates_through_chains() {
        let first = ratio_string("0", "12");
        assert_eq!(ratio_string(&first, "3"), "--");
        assert_eq!(ratio_string("3", &first), "--");
        assert_eq!(ratio(Decimal::ZERO, Decimal::TEN), Ratio::Undefined);
    }

    #[test]
    fn period_total_treats_missing_keys_as_zero() {
        let store = RollupStore::new();
        load(&store, "2022-03-10", CloudProvider::Alibaba, "a", ecs("30"));
        load(&store, "2022-02", CloudProvider::Alibaba, "a", ecs("100"));
        let engine = StatisticsEngine::new(&store, pilot());
        let window = pilot().recent_month_window(true);
        assert_eq!(engine.period_total(&window), Decimal::from(130));
        assert_eq!(engine.period_total(&CalendarWindow::default()), Decimal::ZERO);
    }

    #[test]
    fn composition_groups_by_dimension() {
        let store = RollupStore::new();
        load(
            &store,
            "2022-03-10",
            CloudProvider::Alibaba,
            "a",
            vec![
                item("ecs", "ECS", SubscriptionType::PrePaid, "6"),
                item("ecs", "ECS", SubscriptionType::PostPaid, "4"),
                item("oss", "OSS", SubscriptionType::PostPaid, "15"),
            ],
        );
        load(
            &store,
            "2022-03-10",
            CloudProvider::Aws,
            "b",
            vec![item("EC2 - Other", "EC2 - Other", SubscriptionType::PostPaid, "2")],
        );
        let engine = StatisticsEngine::new(&store, pilot());
        let window = ReportView::RecentDay.window(&pilot());

        let products = engine.composition_ratios(&window, Dimension::Product);
        assert_eq!(products[0], RatioEntry { name: "OSS".into(), value: "15.00".into() });
        assert_eq!(products.len(), 3);

        let providers = engine.composition_ratios(&window, Dimension::Provider);
        assert_eq!(providers[0].name, "Alibaba Cloud");
        assert_eq!(providers[0].value, "25.00");
        assert_eq!(providers[1].name, "AWS");

        let charge = engine.composition_ratios(&window, Dimension::ChargeType);
        assert_eq!(charge.len(), 2);
        assert_eq!(charge[0], RatioEntry { name: "Pay-as-you-go".into(), value: "6.00".into() });
        assert_eq!(charge[1].name, "Subscription");
        assert_eq!(mid_value(&charge), "12.00");

        let quiet_day = CalendarWindow::from_days([parse_day("2022-01-01").expect("day")]);
        assert!(engine.composition_ratios(&quiet_day, Dimension::Product).is_empty());
        assert_eq!(mid_value(&[]), "-");
    }

    #[test]
    fn provider_without_bill_lines_is_left_out_of_composition() {
        let store = RollupStore::new();
        load(&store, "2022-03-10", CloudProvider::Tencent, "quiet", vec![]);
        let engine = StatisticsEngine::new(&store, pilot());
        let window = ReportView::RecentDay.window(&pilot());
        assert!(engine.composition_ratios(&window, Dimension::Provider).is_empty());

        load(&store, "2022-03-10", CloudProvider::Alibaba, "busy", ecs("4"));
        let providers = engine.composition_ratios(&window, Dimension::Provider);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name, "Alibaba Cloud");
        assert_eq!(mid_value(&providers), "4.00");
    }

    #[test]
    fn statistics_compare_with_preceding_periods() {
        let store = RollupStore::new();
        load(&store, "2022-03-10", CloudProvider::Alibaba, "a", ecs("30"));
        load(&store, "2022-03-09", CloudProvider::Alibaba, "a", ecs("20"));
        load(&store, "2022-02-05", CloudProvider::Alibaba, "a", ecs("25"));
        let engine = StatisticsEngine::new(&store, pilot());
        let rows = engine.statistics();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].cycle, "2022-03-10 total");
        assert_eq!(rows[0].amount, "30.00");
        assert_eq!(rows[0].previous_amount, "20.00");
        assert_eq!(rows[0].ratio, "50.00");

        assert_eq!(rows[1].amount, "50.00");
        assert_eq!(rows[1].previous_amount, "25.00");
        assert_eq!(rows[1].ratio, "100.00");

        assert_eq!(rows[3].cycle, "2022 to date");
        assert_eq!(rows[3].previous_amount, "0.00");
        assert_eq!(rows[3].ratio, "--");
    }

    #[test]
    fn day_trend_covers_fourteen_days() {
        let store = RollupStore::new();
        load(&store, "2022-03-10", CloudProvider::Alibaba, "a", ecs("30"));
        load(&store, "2022-03-09", CloudProvider::Alibaba, "a", ecs("20"));
        load(&store, "2021-03-10", CloudProvider::Alibaba, "a", ecs("60"));
        let trend = StatisticsEngine::new(&store, pilot()).day_trend();
        assert_eq!(trend.x_data.len(), 14);
        assert_eq!(trend.x_data.first().map(String::as_str), Some("2022-02-25"));
        assert_eq!(trend.x_data.last().map(String::as_str), Some("2022-03-10"));
        assert_eq!(trend.series.len(), 4);
        assert_eq!(trend.series[0].data.last().map(String::as_str), Some("30.00"));
        assert_eq!(trend.series[1].data.last().map(String::as_str), Some("60.00"));
        assert_eq!(trend.series[2].data.last().map(String::as_str), Some("50.00"));
        assert_eq!(trend.series[2].data[0], "--");
        assert_eq!(trend.series[3].data.last().map(String::as_str), Some("-50.00"));
        assert_eq!(trend.tooltip_unit.bar, "¥");
    }

    #[test]
    fn month_trend_appends_partial_month() {
        let store = RollupStore::new();
        load(&store, "2022-02", CloudProvider::Alibaba, "a", ecs("100"));
        load(&store, "2022-03-01", CloudProvider::Alibaba, "a", ecs("40"));
        load(&store, "2022-03-02", CloudProvider::Alibaba, "a", ecs("10"));
        load(&store, "2021-03-01", CloudProvider::Alibaba, "a", ecs("25"));
        let trend = StatisticsEngine::new(&store, pilot()).month_trend();
        assert_eq!(trend.x_data.len(), 12);
        assert_eq!(trend.x_data[0], "2021-04");
        assert_eq!(trend.x_data[11], "2022-03");
        assert_eq!(trend.series[0].data[11], "50.00");
        assert_eq!(trend.series[1].data[11], "25.00");
        assert_eq!(trend.series[2].data[11], "-50.00");
        assert_eq!(trend.series[3].data[11], "100.00");
    }

    #[test]
    fn month_trend_on_first_day_has_no_partial() {
        let store = RollupStore::new();
        let p = CalendarWindowPilot::new(parse_day("2022-03-01").expect("day"));
        let trend = StatisticsEngine::new(&store, p).month_trend();
        assert_eq!(trend.x_data.len(), 12);
        assert_eq!(trend.x_data[11], "2022-02");
        assert_eq!(trend.tooltip_unit.bar, "");
    }

    #[test]
    fn analyses_label_data_cycle_and_currency() {
        let store = RollupStore::new();
        let usd = vec![AccountBillItem {
            currency: "USD".into(),
            ..item("EC2 - Other", "EC2 - Other", SubscriptionType::PrePaid, "8")
        }];
        load(&store, "2022-03-10", CloudProvider::Aws, "a", usd);
        let engine = StatisticsEngine::new(&store, pilot());
        let day = engine.day_analysis();
        assert_eq!(day.data_cycle, "2022-03-10 23:59:59");
        assert_eq!(day.ratios.len(), 3);
        assert_eq!(day.ratios[0].mid_unit, "$");
        assert_eq!(day.ratios[0].mid_value, "8.00");

        let month = engine.month_analysis();
        assert_eq!(month.view_type, "month");
        assert_eq!(month.ratios[2].data[0].name, "Subscription");

        let json = serde_json::to_value(&month).expect("serialize");
        assert!(json.get("costTrend").is_some());
        assert_eq!(json["costTrend"]["series"][0]["type"], "bar");
    }
}
