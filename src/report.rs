//! Tabular visit report.
//!
//! One row per visit record, rendered as six strings in [`REPORT_COLUMNS`]
//! order. Downstream exporters (CSV, spreadsheet) rely on that order.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::visits::{VisitRecord, VisitStatus};

/// Report header, in column order.
pub const REPORT_COLUMNS: [&str; 6] = [
    "Client Name",
    "Check-In Time",
    "Check-Out Time",
    "Duration (mins)",
    "Status",
    "Location Verified",
];

/// One report line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyReportRow {
    pub client_name: String,
    pub check_in: String,
    /// Empty while the visit is in progress
    pub check_out: String,
    /// Empty while the visit is in progress
    pub duration_minutes: String,
    pub status: String,
    pub location_verified: String,
}

impl JourneyReportRow {
    pub fn from_visit(visit: &VisitRecord) -> Self {
        let check_out = match visit.visit_status {
            VisitStatus::Completed => visit
                .meeting
                .end_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            VisitStatus::InProgress => String::new(),
        };

        Self {
            client_name: visit.client_name().to_string(),
            check_in: visit
                .meeting
                .start_time
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            check_out,
            duration_minutes: visit
                .duration_minutes()
                .map(|m| m.to_string())
                .unwrap_or_default(),
            status: visit.visit_status.label().to_string(),
            location_verified: if visit.verified { "Yes" } else { "No" }.to_string(),
        }
    }

    /// Cells in [`REPORT_COLUMNS`] order.
    pub fn cells(&self) -> [&str; 6] {
        [
            &self.client_name,
            &self.check_in,
            &self.check_out,
            &self.duration_minutes,
            &self.status,
            &self.location_verified,
        ]
    }
}

/// Build the report rows for a set of visits, in visit order.
pub fn journey_report(visits: &[VisitRecord]) -> Vec<JourneyReportRow> {
    visits.iter().map(JourneyReportRow::from_visit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientLocation, Meeting, Ping};
    use crate::GpsPoint;
    use chrono::{TimeZone, Utc};

    fn visit(done: bool, verified: bool, client: Option<&str>) -> VisitRecord {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
        let mut meeting = Meeting::new("m1", "c1", start);
        meeting.client_name = Some("From Meeting".to_string());
        if done {
            meeting.end_time = Some(Utc.with_ymd_and_hms(2024, 6, 3, 10, 45, 30).unwrap());
        }
        VisitRecord {
            visit_status: VisitStatus::for_meeting(&meeting),
            closest_ping: Ping::new(start, 0.0, 0.0),
            meeting,
            matched_client: client
                .map(|name| ClientLocation::new("c1", name, Some(GpsPoint::new(0.0, 0.0)))),
            distance_to_client_km: Some(0.0),
            verified,
        }
    }

    #[test]
    fn test_columns_exact() {
        assert_eq!(
            REPORT_COLUMNS.join(","),
            "Client Name,Check-In Time,Check-Out Time,Duration (mins),Status,Location Verified"
        );
    }

    #[test]
    fn test_completed_row() {
        let row = JourneyReportRow::from_visit(&visit(true, true, Some("Acme")));
        assert_eq!(
            row.cells(),
            [
                "Acme",
                "2024-06-03T10:00:00Z",
                "2024-06-03T10:45:30Z",
                "45",
                "Completed",
                "Yes"
            ]
        );
    }

    #[test]
    fn test_in_progress_row() {
        let row = JourneyReportRow::from_visit(&visit(false, false, None));
        assert_eq!(row.client_name, "From Meeting");
        assert_eq!(row.check_out, "");
        assert_eq!(row.duration_minutes, "");
        assert_eq!(row.status, "In Progress");
        assert_eq!(row.location_verified, "No");
    }

    #[test]
    fn test_report_keeps_order() {
        let rows = journey_report(&[visit(true, true, Some("A")), visit(false, false, Some("B"))]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].client_name, "A");
        assert_eq!(rows[1].client_name, "B");
        assert!(journey_report(&[]).is_empty());
    }
}
