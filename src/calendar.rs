use crate::error::AppError;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub fn is_leap_year(year: i32) -> bool {
    if year % 4 == 0 {
        if year % 100 == 0 {
            return year % 400 == 0;
        }
        return true;
    }
    false
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        2 if is_leap_year(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Moves `date` by `months` calendar months. Out-of-range month numbers carry
/// into the year and the day is clamped to the last day of the target month.
pub fn add_months(date: NaiveDate, months: i32) -> NaiveDate {
    let total = date.year() * 12 + date.month0() as i32 + months;
    let year = total.div_euclid(12);
    let month = total.rem_euclid(12) as u32 + 1;
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(if months < 0 {
        NaiveDate::MIN
    } else {
        NaiveDate::MAX
    })
}

fn days_before(date: NaiveDate, n: u32) -> NaiveDate {
    date.checked_sub_signed(Duration::days(i64::from(n)))
        .unwrap_or(NaiveDate::MIN)
}

fn days_after(date: NaiveDate, n: usize) -> NaiveDate {
    date.checked_add_signed(Duration::days(n as i64))
        .unwrap_or(NaiveDate::MAX)
}

pub fn parse_day(raw: &str) -> Result<NaiveDate, AppError> {
    let malformed = || AppError::MalformedKey {
        key: raw.to_string(),
        expected: "YYYY-MM-DD",
    };
    if raw.len() != 10 {
        return Err(malformed());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| malformed())
}

pub fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// A calendar month, stored as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MonthKey(NaiveDate);

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    pub fn of(date: NaiveDate) -> Self {
        Self(date.with_day(1).unwrap_or(date))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn add_months(&self, months: i32) -> Self {
        Self(add_months(self.0, months))
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for MonthKey {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || AppError::MalformedKey {
            key: raw.to_string(),
            expected: "YYYY-MM",
        };
        if raw.len() != 7 {
            return Err(malformed());
        }
        let (year, month) = raw.split_once('-').ok_or_else(malformed)?;
        let digits =
            |part: &str, len: usize| part.len() == len && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(year, 4) || !digits(month, 2) {
            return Err(malformed());
        }
        let year: i32 = year.parse().map_err(|_| malformed())?;
        let month: u32 = month.parse().map_err(|_| malformed())?;
        MonthKey::new(year, month).ok_or_else(malformed)
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for MonthKey {
    type Error = AppError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "DAILY")]
    Daily,
    #[serde(rename = "MONTHLY")]
    Monthly,
}

/// The sole lookup key into a rollup store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PeriodKey {
    Day(NaiveDate),
    Month(MonthKey),
}

impl PeriodKey {
    pub fn granularity(&self) -> Granularity {
        match self {
            PeriodKey::Day(_) => Granularity::Daily,
            PeriodKey::Month(_) => Granularity::Monthly,
        }
    }

    pub fn billing_cycle(&self) -> MonthKey {
        match self {
            PeriodKey::Day(day) => MonthKey::of(*day),
            PeriodKey::Month(month) => *month,
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodKey::Day(day) => write!(f, "{}", day.format("%Y-%m-%d")),
            PeriodKey::Month(month) => write!(f, "{month}"),
        }
    }
}

impl FromStr for PeriodKey {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.len() {
            7 => raw.parse().map(PeriodKey::Month),
            _ => parse_day(raw).map(PeriodKey::Day),
        }
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = AppError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

/// A reporting period: completed months plus trailing partial days.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarWindow {
    pub months: BTreeSet<MonthKey>,
    pub days: BTreeSet<NaiveDate>,
}

impl CalendarWindow {
    pub fn from_days(days: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            months: BTreeSet::new(),
            days: days.into_iter().collect(),
        }
    }

    pub fn from_months(months: impl IntoIterator<Item = MonthKey>) -> Self {
        Self {
            months: months.into_iter().collect(),
            days: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty() && self.days.is_empty()
    }

    pub fn union(&self, other: &CalendarWindow) -> CalendarWindow {
        CalendarWindow {
            months: self.months.union(&other.months).copied().collect(),
            days: self.days.union(&other.days).copied().collect(),
        }
    }

    pub fn periods(&self) -> impl Iterator<Item = PeriodKey> + '_ {
        self.months
            .iter()
            .map(|m| PeriodKey::Month(*m))
            .chain(self.days.iter().map(|d| PeriodKey::Day(*d)))
    }

    pub fn month_keys(&self) -> Vec<String> {
        self.months.iter().map(ToString::to_string).collect()
    }

    pub fn day_keys(&self) -> Vec<String> {
        self.days.iter().map(|d| format_day(*d)).collect()
    }
}

pub fn union_windows(a: &CalendarWindow, b: &CalendarWindow) -> CalendarWindow {
    a.union(b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    Month,
    Quarter,
    Year,
}

impl PeriodKind {
    fn first_month(self, month: u32) -> u32 {
        match self {
            PeriodKind::Month => month,
            PeriodKind::Quarter => (month - 1) / 3 * 3 + 1,
            PeriodKind::Year => 1,
        }
    }
}

/// Date arithmetic for the reporting views, anchored on an injected "now".
/// Today is never part of a window because its billing is not final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarWindowPilot {
    now: NaiveDate,
}

impl CalendarWindowPilot {
    pub fn new(now: NaiveDate) -> Self {
        Self { now }
    }

    pub fn now(&self) -> NaiveDate {
        self.now
    }

    pub fn is_first_day_of_month(&self) -> bool {
        self.now.day() == 1
    }

    pub fn recent_day(&self) -> NaiveDate {
        days_before(self.now, 1)
    }

    pub fn previous_day(&self) -> NaiveDate {
        days_before(self.now, 2)
    }

    /// Quarter number (1-4) of yesterday.
    pub fn recent_quarter(&self) -> u32 {
        (self.recent_day().month() - 1) / 3 + 1
    }

    pub fn recent_year(&self) -> i32 {
        self.recent_day().year()
    }

    fn current_month(&self) -> MonthKey {
        MonthKey::of(self.now)
    }

    fn elapsed_days_in_month(&self) -> BTreeSet<NaiveDate> {
        let first = self.current_month().first_day();
        first.iter_days().take_while(|d| *d < self.now).collect()
    }

    pub fn recent_days(&self, n: u32) -> CalendarWindow {
        CalendarWindow::from_days((1..=n).rev().map(|i| days_before(self.now, i)))
    }

    /// `n` full months before the current one plus the complete days of the
    /// current month so far.
    pub fn recent_months(&self, n: u32) -> CalendarWindow {
        let current = self.current_month();
        CalendarWindow {
            months: (1..=n).rev().map(|i| current.add_months(-(i as i32))).collect(),
            days: self.elapsed_days_in_month(),
        }
    }

    /// `n` periods in total, the newest being the partial current month, or
    /// the month that just ended when today is the 1st.
    pub fn trailing_periods(&self, n: u32) -> CalendarWindow {
        if n == 0 {
            return CalendarWindow::default();
        }
        if self.is_first_day_of_month() {
            self.recent_months(n)
        } else {
            self.recent_months(n - 1)
        }
    }

    /// The most recent completed month, optionally followed by the elapsed
    /// days of the current month.
    pub fn recent_month_window(&self, include_current_partial: bool) -> CalendarWindow {
        let mut window = CalendarWindow::from_months([self.current_month().add_months(-1)]);
        if include_current_partial {
            window.days = self.elapsed_days_in_month();
        }
        window
    }

    pub fn recent_quarter_window(&self, include_current_partial: bool) -> CalendarWindow {
        self.to_date(PeriodKind::Quarter, include_current_partial)
    }

    pub fn recent_year_window(&self, include_current_partial: bool) -> CalendarWindow {
        self.to_date(PeriodKind::Year, include_current_partial)
    }

    /// Month, quarter or year to date. On the 1st the period containing
    /// yesterday is reported, entirely as completed months.
    pub fn period_to_date(&self, kind: PeriodKind) -> CalendarWindow {
        self.to_date(kind, true)
    }

    fn to_date(&self, kind: PeriodKind, include_current_partial: bool) -> CalendarWindow {
        let anchor = MonthKey::of(self.recent_day());
        let partial = self.elapsed_days_in_month();
        let start = MonthKey::new(anchor.year(), kind.first_month(anchor.month())).unwrap_or(anchor);

        let mut months = BTreeSet::new();
        let mut month = start;
        while month < anchor || (month == anchor && partial.is_empty()) {
            months.insert(month);
            month = month.add_months(1);
        }

        CalendarWindow {
            months,
            days: if include_current_partial {
                partial
            } else {
                BTreeSet::new()
            },
        }
    }

    pub fn shift_to_previous_year(&self, window: &CalendarWindow) -> CalendarWindow {
        CalendarWindow {
            months: window.months.iter().map(|m| m.add_months(-12)).collect(),
            days: window.days.iter().map(|d| add_months(*d, -12)).collect(),
        }
    }

    pub fn shift_to_previous_month(&self, window: &CalendarWindow) -> CalendarWindow {
        shift_collapsing(window, 1)
    }

    pub fn shift_to_previous_quarter(&self, window: &CalendarWindow) -> CalendarWindow {
        shift_collapsing(window, 3)
    }
}

/// Shifts a window back by `months`. When the trailing days start on the 1st
/// and, replayed from the shifted first day, would spill past the shifted
/// month, that whole month has elapsed and is reported as one month key.
fn shift_collapsing(window: &CalendarWindow, months: i32) -> CalendarWindow {
    let mut shifted = CalendarWindow::from_months(window.months.iter().map(|m| m.add_months(-months)));

    let Some(first) = window.days.first().copied() else {
        return shifted;
    };
    let shifted_first = add_months(first, -months);
    let replay_end = days_after(shifted_first, window.days.len());
    if first.day() == 1 && MonthKey::of(replay_end) == MonthKey::of(add_months(first, 1 - months)) {
        shifted.months.insert(MonthKey::of(shifted_first));
        return shifted;
    }

    shifted.days = window.days.iter().map(|d| add_months(*d, -months)).collect();
    shifted
}

/// The fixed set of windows the dashboards are built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportView {
    RecentDay,
    PreviousDay,
    RecentDays(u32),
    PreviousYearRecentDays(u32),
    TrailingMonths(u32),
    MonthToDate,
    PreviousMonthToDate,
    QuarterToDate,
    PreviousQuarterToDate,
    YearToDate,
    PreviousYearToDate,
}

impl ReportView {
    pub fn window(&self, pilot: &CalendarWindowPilot) -> CalendarWindow {
        match *self {
            ReportView::RecentDay => CalendarWindow::from_days([pilot.recent_day()]),
            ReportView::PreviousDay => CalendarWindow::from_days([pilot.previous_day()]),
            ReportView::RecentDays(n) => pilot.recent_days(n),
            ReportView::PreviousYearRecentDays(n) => {
                pilot.shift_to_previous_year(&pilot.recent_days(n))
            }
            ReportView::TrailingMonths(n) => pilot.trailing_periods(n),
            ReportView::MonthToDate => pilot.period_to_date(PeriodKind::Month),
            ReportView::PreviousMonthToDate => {
                pilot.shift_to_previous_month(&pilot.period_to_date(PeriodKind::Month))
            }
            ReportView::QuarterToDate => pilot.period_to_date(PeriodKind::Quarter),
            ReportView::PreviousQuarterToDate => {
                pilot.shift_to_previous_quarter(&pilot.period_to_date(PeriodKind::Quarter))
            }
            ReportView::YearToDate => pilot.period_to_date(PeriodKind::Year),
            ReportView::PreviousYearToDate => {
                pilot.shift_to_previous_year(&pilot.period_to_date(PeriodKind::Year))
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            ReportView::RecentDay => "recent-day".into(),
            ReportView::PreviousDay => "previous-day".into(),
            ReportView::RecentDays(n) => format!("recent-{n}-days"),
            ReportView::PreviousYearRecentDays(n) => format!("previous-year-recent-{n}-days"),
            ReportView::TrailingMonths(n) => format!("trailing-{n}-months"),
            ReportView::MonthToDate => "month-to-date".into(),
            ReportView::PreviousMonthToDate => "previous-month-to-date".into(),
            ReportView::QuarterToDate => "quarter-to-date".into(),
            ReportView::PreviousQuarterToDate => "previous-quarter-to-date".into(),
            ReportView::YearToDate => "year-to-date".into(),
            ReportView::PreviousYearToDate => "previous-year-to-date".into(),
        }
    }
}
