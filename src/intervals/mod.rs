//! Historical date windows handed to the workflows.
//!
//! Every window carries a `since` one day before the first covered day: the
//! Graph API treats `since` as exclusive for day-period insights, so the
//! window `[label, until]` is what actually comes back.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Days back from today covered by the rolling daily mode.
///
/// Zero keeps the mode disabled: it yields no windows.
const LAST_DAYS_SPAN: u64 = 0;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntervalError {
    #[error("calendar arithmetic out of range ({months} months back from {today})")]
    OutOfRange { today: NaiveDate, months: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IntervalMode {
    #[default]
    Monthly,
    HalfMonth,
    #[serde(rename = "last_30_days")]
    #[value(name = "last-30-days")]
    Last30Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TimeWindow {
    pub since: NaiveDate,
    pub until: NaiveDate,
    /// Day used in artifact names: the first covered day, except for the
    /// second half of a month, which is labelled by its `since` (the 15th).
    pub label: NaiveDate,
}

impl TimeWindow {
    fn covering(first: NaiveDate, last: NaiveDate) -> Option<Self> {
        Some(Self {
            since: first.checked_sub_days(Days::new(1))?,
            until: last,
            label: first,
        })
    }

    pub fn since_str(&self) -> String {
        self.since.format("%Y-%m-%d").to_string()
    }

    pub fn until_str(&self) -> String {
        self.until.format("%Y-%m-%d").to_string()
    }

    /// `<label>_<until>`: artifact key for per-window domains.
    pub fn window_key(&self) -> String {
        format!("{}_{}", self.label.format("%Y-%m-%d"), self.until_str())
    }

    /// `<id>_<since>_to_<until>`: artifact key for per-entity, per-window domains.
    pub fn entity_key(&self, entity_id: &str) -> String {
        format!("{}_{}_to_{}", entity_id, self.since_str(), self.until_str())
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} → {}", self.since, self.until)
    }
}

/// Generates the windows for `mode`, walking back `num_months` from `today`.
pub fn generate(
    mode: IntervalMode,
    today: NaiveDate,
    num_months: u32,
) -> Result<Vec<TimeWindow>, IntervalError> {
    match mode {
        IntervalMode::Monthly => monthly(today, num_months),
        IntervalMode::HalfMonth => half_month(today, num_months),
        IntervalMode::Last30Days => last_days(today, LAST_DAYS_SPAN),
    }
}

/// One window per calendar month: the in-progress month, then `num_months`
/// full months before it, newest first.
pub fn monthly(today: NaiveDate, num_months: u32) -> Result<Vec<TimeWindow>, IntervalError> {
    (0..=num_months)
        .map(|i| {
            let (first, last) = month_bounds(today, i)
                .ok_or(IntervalError::OutOfRange { today, months: i })?;
            TimeWindow::covering(first, last).ok_or(IntervalError::OutOfRange { today, months: i })
        })
        .collect()
}

/// Same walk as [`monthly`], each month split into days 1–15 and 16–end.
pub fn half_month(today: NaiveDate, num_months: u32) -> Result<Vec<TimeWindow>, IntervalError> {
    let mut windows = Vec::with_capacity((num_months as usize + 1) * 2);

    for i in 0..=num_months {
        let err = IntervalError::OutOfRange { today, months: i };
        let (first, last) = month_bounds(today, i).ok_or(err.clone())?;
        let mid = first.with_day(15).ok_or(err.clone())?;
        let second_start = first.with_day(16).ok_or(err.clone())?;

        windows.push(TimeWindow::covering(first, mid).ok_or(err.clone())?);
        let mut second = TimeWindow::covering(second_start, last).ok_or(err)?;
        second.label = second.since;
        windows.push(second);
    }

    Ok(windows)
}

/// Daily windows for the `span` days before `today`.
pub fn last_days(today: NaiveDate, span: u64) -> Result<Vec<TimeWindow>, IntervalError> {
    (1..=span)
        .map(|i| {
            let day = today
                .checked_sub_days(Days::new(i))
                .ok_or(IntervalError::OutOfRange { today, months: 0 })?;
            TimeWindow::covering(day, day).ok_or(IntervalError::OutOfRange { today, months: 0 })
        })
        .collect()
}

/// First and last day of the month `back` months before the month of `today`.
fn month_bounds(today: NaiveDate, back: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = today.with_day(1)?.checked_sub_months(Months::new(back))?;
    let last = first
        .checked_add_months(Months::new(1))?
        .checked_sub_days(Days::new(1))?;
    Some((first, last))
}
