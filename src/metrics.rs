//! Journey metrics aggregation.
//!
//! Combines the date-window filter, distance accumulation and visit matching
//! into one [`JourneyMetrics`] summary per (agent, date range) query. Metrics
//! are never persisted; they are recomputed whenever their inputs change.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::distance::{accumulate, round_1dp, simplify_route};
use crate::error::Result;
use crate::time_window::{filter_by_window, DateRange};
use crate::types::{ExpenseRecord, JourneySnapshot, Ping};
use crate::visits::{match_visits, VisitRecord, VisitStatus};
use crate::GpsPoint;

/// Per-transport-mode expense totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportModeTotal {
    pub mode: String,
    pub trip_count: usize,
    pub distance_km: f64,
    pub amount_spent: f64,
}

/// Aggregate totals over the expense records in range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpenseSummary {
    pub trip_count: usize,
    /// Claimed distance, rounded to 1 decimal place
    pub total_distance_km: f64,
    /// Rounded to 2 decimal places
    pub total_amount_spent: f64,
    /// Sorted by mode name
    pub by_transport_mode: Vec<TransportModeTotal>,
}

/// Summary of one agent's journey over a date range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JourneyMetrics {
    pub total_distance_km: f64,
    pub total_duration_minutes: i64,
    pub start_ping: Option<Ping>,
    pub end_ping: Option<Ping>,
    pub visit_records: Vec<VisitRecord>,
    /// Meetings with a check-out
    pub visited_count: usize,
    /// All meetings in range
    pub planned_count: usize,
    pub verified_count: usize,
    pub route_polyline: Vec<GpsPoint>,
    pub expenses: ExpenseSummary,
}

impl JourneyMetrics {
    /// Explicit zero-valued metrics for a query with no pings and no meetings.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Sum expense records into an [`ExpenseSummary`].
pub fn summarize_expenses(expenses: &[ExpenseRecord]) -> ExpenseSummary {
    let mut modes: BTreeMap<String, TransportModeTotal> = BTreeMap::new();
    let mut total_distance = 0.0;
    let mut total_amount = 0.0;

    for expense in expenses {
        total_distance += expense.distance_km;
        total_amount += expense.amount_spent;

        let mode = if expense.transport_mode.trim().is_empty() {
            "Other".to_string()
        } else {
            expense.transport_mode.trim().to_string()
        };
        let entry = modes.entry(mode.clone()).or_insert(TransportModeTotal {
            mode,
            trip_count: 0,
            distance_km: 0.0,
            amount_spent: 0.0,
        });
        entry.trip_count += 1;
        entry.distance_km += expense.distance_km;
        entry.amount_spent += expense.amount_spent;
    }

    ExpenseSummary {
        trip_count: expenses.len(),
        total_distance_km: round_1dp(total_distance),
        total_amount_spent: (total_amount * 100.0).round() / 100.0,
        by_transport_mode: modes
            .into_values()
            .map(|mut m| {
                m.distance_km = round_1dp(m.distance_km);
                m.amount_spent = (m.amount_spent * 100.0).round() / 100.0;
                m
            })
            .collect(),
    }
}

/// Compute metrics for one snapshot over `range`.
///
/// Empty pings and empty meetings yield [`JourneyMetrics::empty`] (plus any
/// expense totals). Meetings without pings fail with
/// [`crate::JourneyError::EmptyPingSet`]. A snapshot with unusable
/// coordinates is sanitized on a copy first.
pub fn compute_journey_metrics(
    snapshot: &JourneySnapshot,
    range: &DateRange,
    config: &EngineConfig,
) -> Result<JourneyMetrics> {
    let sanitized;
    let snapshot = if snapshot.invalid_coordinate_count() > 0 {
        let mut copy = snapshot.clone();
        copy.sanitize();
        sanitized = copy;
        &sanitized
    } else {
        snapshot
    };

    let pings = filter_by_window(&snapshot.pings, range);
    let meetings = filter_by_window(&snapshot.meetings, range);
    let expenses = summarize_expenses(&filter_by_window(&snapshot.expenses, range));

    if pings.is_empty() && meetings.is_empty() {
        debug!(
            "[Metrics] No pings or meetings for agent '{}' in {} - {}",
            snapshot.agent_id, range.start, range.end
        );
        return Ok(JourneyMetrics {
            expenses,
            ..JourneyMetrics::empty()
        });
    }

    let visit_records = match_visits(&meetings, &pings, &snapshot.clients, &config.verification)?;
    let route = accumulate(&pings);

    let route_polyline = if config.route_simplification_deg > 0.0 {
        simplify_route(&route.route, config.route_simplification_deg)
    } else {
        route.route
    };

    let visited_count = visit_records
        .iter()
        .filter(|r| r.visit_status == VisitStatus::Completed)
        .count();
    let verified_count = visit_records.iter().filter(|r| r.verified).count();

    debug!(
        "[Metrics] Agent '{}': {:.1} km over {} min, {}/{} visited, {} verified",
        snapshot.agent_id,
        route.total_distance_km,
        route.duration_minutes,
        visited_count,
        meetings.len(),
        verified_count
    );

    Ok(JourneyMetrics {
        total_distance_km: route.total_distance_km,
        total_duration_minutes: route.duration_minutes,
        start_ping: pings.first().cloned(),
        end_ping: pings.last().cloned(),
        planned_count: meetings.len(),
        visited_count,
        verified_count,
        visit_records,
        route_polyline,
        expenses,
    })
}

/// Compute metrics for several agents independently.
///
/// Each snapshot is processed on its own; pings are never mixed across agents.
/// Results keep input order.
pub fn compute_batch(
    snapshots: &[JourneySnapshot],
    range: &DateRange,
    config: &EngineConfig,
) -> Vec<(String, Result<JourneyMetrics>)> {
    snapshots
        .iter()
        .map(|s| (s.agent_id.clone(), compute_journey_metrics(s, range, config)))
        .collect()
}

/// Parallel version of [`compute_batch`].
#[cfg(feature = "parallel")]
pub fn compute_batch_parallel(
    snapshots: &[JourneySnapshot],
    range: &DateRange,
    config: &EngineConfig,
) -> Vec<(String, Result<JourneyMetrics>)> {
    snapshots
        .par_iter()
        .map(|s| (s.agent_id.clone(), compute_journey_metrics(s, range, config)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientLocation, Meeting};
    use crate::JourneyError;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn day() -> DateRange {
        DateRange::single_day(NaiveDate::from_ymd_opt(2024, 7, 15).unwrap())
    }

    fn expense(mode: &str, km: f64, amount: f64) -> ExpenseRecord {
        ExpenseRecord {
            travel_date: t(60),
            distance_km: km,
            amount_spent: amount,
            transport_mode: mode.to_string(),
            start_location: "Depot".to_string(),
            end_location: "Market".to_string(),
            legs: Vec::new(),
            receipt_images: Vec::new(),
        }
    }

    fn snapshot() -> JourneySnapshot {
        let mut snap = JourneySnapshot::new("agent-7");
        snap.pings = vec![
            Ping::new(t(0), 0.0, 0.0),
            Ping::new(t(10), 0.0, 0.01),
            Ping::new(t(40), 0.0, 0.02),
        ];
        let mut done = Meeting::new("m1", "c1", t(9));
        done.end_time = Some(t(30));
        let open = Meeting::new("m2", "c2", t(39));
        snap.meetings = vec![done, open];
        snap.clients = vec![
            ClientLocation::new("c1", "Near", Some(GpsPoint::new(0.0, 0.0101))),
            ClientLocation::new("c2", "Far", Some(GpsPoint::new(1.0, 1.0))),
        ];
        snap
    }

    #[test]
    fn test_full_metrics() {
        let metrics =
            compute_journey_metrics(&snapshot(), &day(), &EngineConfig::default()).unwrap();

        assert_eq!(metrics.total_distance_km, 2.2);
        assert_eq!(metrics.total_duration_minutes, 40);
        assert_eq!(metrics.planned_count, 2);
        assert_eq!(metrics.visited_count, 1);
        assert_eq!(metrics.verified_count, 1);
        assert_eq!(metrics.route_polyline.len(), 3);
        assert_eq!(metrics.start_ping.unwrap().timestamp, t(0));
        assert_eq!(metrics.end_ping.unwrap().timestamp, t(40));
    }

    #[test]
    fn test_unusable_ping_never_reaches_distance() {
        let mut snap = JourneySnapshot::new("agent-7");
        snap.pings = vec![
            Ping::new(t(0), 0.0, 0.0),
            Ping::new(t(5), f64::NAN, 0.0),
            Ping::new(t(10), 0.0, 0.01),
        ];
        snap.clients = vec![ClientLocation::new(
            "c1",
            "Broken",
            Some(GpsPoint::new(f64::INFINITY, 0.0)),
        )];
        snap.meetings = vec![Meeting::new("m1", "c1", t(5))];

        let metrics = compute_journey_metrics(&snap, &day(), &EngineConfig::default()).unwrap();
        assert!(metrics.total_distance_km >= 0.0);
        assert_eq!(metrics.total_distance_km, 1.1);
        assert_eq!(metrics.route_polyline.len(), 2);
        assert_eq!(metrics.visit_records[0].distance_to_client_km, None);
        assert!(!metrics.visit_records[0].verified);
    }

    #[test]
    fn test_no_data_is_zero_metrics() {
        let snap = JourneySnapshot::new("agent-0");
        let metrics = compute_journey_metrics(&snap, &day(), &EngineConfig::default()).unwrap();
        assert_eq!(metrics, JourneyMetrics::empty());
    }

    #[test]
    fn test_meetings_without_pings_is_error() {
        let mut snap = snapshot();
        snap.pings.clear();
        let result = compute_journey_metrics(&snap, &day(), &EngineConfig::default());
        assert_eq!(result, Err(JourneyError::EmptyPingSet { meeting_count: 2 }));
    }

    #[test]
    fn test_out_of_range_data_is_ignored() {
        let other_day = DateRange::single_day(NaiveDate::from_ymd_opt(2024, 7, 16).unwrap());
        let metrics =
            compute_journey_metrics(&snapshot(), &other_day, &EngineConfig::default()).unwrap();
        assert_eq!(metrics.planned_count, 0);
        assert_eq!(metrics.total_distance_km, 0.0);
    }

    #[test]
    fn test_pings_without_meetings() {
        let mut snap = snapshot();
        snap.meetings.clear();
        let metrics = compute_journey_metrics(&snap, &day(), &EngineConfig::default()).unwrap();
        assert_eq!(metrics.planned_count, 0);
        assert!(metrics.visit_records.is_empty());
        assert_eq!(metrics.total_distance_km, 2.2);
    }

    #[test]
    fn test_expense_summary() {
        let summary = summarize_expenses(&[
            expense("Bike", 12.25, 100.0),
            expense("Car", 30.0, 450.5),
            expense("Bike", 8.0, 60.25),
            expense("  ", 1.0, 5.0),
        ]);

        assert_eq!(summary.trip_count, 4);
        assert_eq!(summary.total_distance_km, 51.3);
        assert_eq!(summary.total_amount_spent, 615.75);
        let modes: Vec<_> = summary.by_transport_mode.iter().map(|m| m.mode.as_str()).collect();
        assert_eq!(modes, vec!["Bike", "Car", "Other"]);
        assert_eq!(summary.by_transport_mode[0].trip_count, 2);
        assert_eq!(summary.by_transport_mode[0].distance_km, 20.3);
    }

    #[test]
    fn test_expenses_reported_without_journey_data() {
        let mut snap = JourneySnapshot::new("agent-3");
        snap.expenses = vec![expense("Bus", 4.0, 20.0)];
        let metrics = compute_journey_metrics(&snap, &day(), &EngineConfig::default()).unwrap();
        assert_eq!(metrics.total_distance_km, 0.0);
        assert_eq!(metrics.expenses.trip_count, 1);
    }

    #[test]
    fn test_batch_keeps_agents_separate() {
        let a = snapshot();
        let mut b = JourneySnapshot::new("agent-8");
        b.pings = vec![Ping::new(t(0), 10.0, 10.0)];

        let results = compute_batch(&[a, b], &day(), &EngineConfig::default());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "agent-7");
        assert_eq!(results[0].1.as_ref().unwrap().total_distance_km, 2.2);
        assert_eq!(results[1].1.as_ref().unwrap().total_distance_km, 0.0);
    }
}
