//! Date-range restriction and chronological ordering.
//!
//! Everything that flows into distance accumulation or visit matching goes
//! through [`filter_by_window`] first, which guarantees ascending timestamps.

use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{JourneyError, Result};
use crate::types::{ClientLocation, ExpenseRecord, Meeting, Ping};

/// Anything carrying a point in time.
///
/// `None` means the timestamp was missing or could not be parsed; such items
/// are dropped by the filter rather than treated as errors.
pub trait Timestamped {
    fn timestamp(&self) -> Option<DateTime<Utc>>;
}

impl Timestamped for Ping {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.timestamp)
    }
}

impl Timestamped for Meeting {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.start_time)
    }
}

impl Timestamped for ExpenseRecord {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.travel_date)
    }
}

impl Timestamped for ClientLocation {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

/// Inclusive calendar-date range, evaluated on UTC day boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(JourneyError::InvalidDateRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// A range covering exactly one day.
    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// Whether the instant falls on one of the range's days.
    pub fn contains(&self, instant: &DateTime<Utc>) -> bool {
        let day = instant.date_naive();
        day >= self.start && day <= self.end
    }
}

/// Restrict `items` to `range` and sort them ascending by timestamp.
///
/// The sort is stable, so items sharing a timestamp keep their input order.
/// Items without a usable timestamp are dropped.
pub fn filter_by_window<T: Timestamped + Clone>(items: &[T], range: &DateRange) -> Vec<T> {
    let mut dropped = 0usize;
    let mut kept: Vec<(DateTime<Utc>, &T)> = Vec::with_capacity(items.len());

    for item in items {
        match item.timestamp() {
            Some(ts) if range.contains(&ts) => kept.push((ts, item)),
            Some(_) => {}
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        debug!(
            "[TimeWindow] Dropped {} item(s) with unparseable timestamps",
            dropped
        );
    }

    kept.sort_by_key(|(ts, _)| *ts);
    kept.into_iter().map(|(_, item)| item.clone()).collect()
}
