//! Canonical domain records.
//!
//! These are the shapes every engine component works with. Backend JSON
//! reaches them through [`crate::ingest::Normalizer`]; a [`JourneySnapshot`]
//! assembled any other way is passed through [`JourneySnapshot::sanitize`]
//! before its coordinates are used.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{Geotagged, GpsPoint};

/// One timestamped GPS observation from a field agent's device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: DateTime<Utc>,
    pub location: GpsPoint,
    /// Horizontal accuracy in metres, as reported by the device
    pub accuracy: Option<f64>,
    /// Battery level (0-100)
    pub battery: Option<f64>,
    pub region_code: Option<String>,
    pub activity: Option<String>,
}

impl Ping {
    /// Minimal ping with only a time and position.
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            location: GpsPoint::new(latitude, longitude),
            accuracy: None,
            battery: None,
            region_code: None,
            activity: None,
        }
    }
}

/// A scheduled client meeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: String,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Absent while the meeting is still in progress
    pub end_time: Option<DateTime<Utc>>,
    /// Where the agent checked in. Cleared when the device sent unusable coordinates.
    pub start_location: Option<GpsPoint>,
    pub status: String,
    pub comments: Option<String>,
    pub attachments: Vec<String>,
}

impl Meeting {
    /// Minimal meeting for a client id starting at `start_time`.
    pub fn new(id: &str, client_id: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            client_id: Some(client_id.to_string()),
            client_name: None,
            start_time,
            end_time: None,
            start_location: None,
            status: String::new(),
            comments: None,
            attachments: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }
}

/// A client record with its (optional) declared location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientLocation {
    pub id: String,
    pub name: String,
    /// Declared location; `None` disables visit verification for this client
    pub location: Option<GpsPoint>,
    pub status: String,
    pub region_code: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl ClientLocation {
    pub fn new(id: &str, name: &str, location: Option<GpsPoint>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            location,
            status: "active".to_string(),
            region_code: None,
            created_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("active")
    }
}

/// One leg of a multi-stop trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseLeg {
    pub from: String,
    pub to: String,
    pub distance_km: f64,
    pub transport_mode: Option<String>,
}

/// A travel-expense claim. Only used for aggregate totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    pub travel_date: DateTime<Utc>,
    pub distance_km: f64,
    pub amount_spent: f64,
    pub transport_mode: String,
    pub start_location: String,
    pub end_location: String,
    pub legs: Vec<ExpenseLeg>,
    pub receipt_images: Vec<String>,
}

/// Immutable set of source collections for one agent, as fetched together.
///
/// Built only after every collection has been fetched; never partially filled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JourneySnapshot {
    pub agent_id: String,
    pub pings: Vec<Ping>,
    pub meetings: Vec<Meeting>,
    pub clients: Vec<ClientLocation>,
    pub expenses: Vec<ExpenseRecord>,
}

impl JourneySnapshot {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            ..Self::default()
        }
    }

    /// Records whose coordinates are non-finite or outside WGS84 range.
    pub fn invalid_coordinate_count(&self) -> usize {
        let bad = |p: &Option<GpsPoint>| p.is_some_and(|p| !p.is_valid());
        self.pings.iter().filter(|p| !p.location.is_valid()).count()
            + self.meetings.iter().filter(|m| bad(&m.start_location)).count()
            + self.clients.iter().filter(|c| bad(&c.location)).count()
    }

    /// Drop pings with unusable coordinates and clear unusable meeting
    /// check-in points and client locations, as ingestion does.
    ///
    /// Returns the number of records dropped or repaired.
    pub fn sanitize(&mut self) -> usize {
        let pings_before = self.pings.len();
        self.pings.retain(|p| p.location.is_valid());
        let dropped = pings_before - self.pings.len();

        let mut cleared_meetings = 0;
        for meeting in &mut self.meetings {
            if meeting.start_location.is_some_and(|p| !p.is_valid()) {
                meeting.start_location = None;
                cleared_meetings += 1;
            }
        }

        let mut cleared_clients = 0;
        for client in &mut self.clients {
            if client.location.is_some_and(|p| !p.is_valid()) {
                client.location = None;
                cleared_clients += 1;
            }
        }

        let touched = dropped + cleared_meetings + cleared_clients;
        if touched > 0 {
            warn!(
                "[Snapshot] '{}': dropped {} bad pings, cleared {} check-ins/{} clients",
                self.agent_id, dropped, cleared_meetings, cleared_clients
            );
        }
        touched
    }
}

impl Geotagged for Ping {
    fn position(&self) -> Option<GpsPoint> {
        Some(self.location)
    }
}

impl Geotagged for Meeting {
    fn position(&self) -> Option<GpsPoint> {
        self.start_location
    }
}

impl Geotagged for ClientLocation {
    fn position(&self) -> Option<GpsPoint> {
        self.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 10, minute, 0).unwrap()
    }

    #[test]
    fn test_sanitize_drops_and_clears_bad_coordinates() {
        let mut snapshot = JourneySnapshot::new("agent-1");
        snapshot.pings = vec![
            Ping::new(at(0), 0.0, 0.0),
            Ping::new(at(5), f64::NAN, 0.0),
            Ping::new(at(10), 0.0, 0.01),
            Ping::new(at(15), 91.0, 0.0),
        ];
        let mut meeting = Meeting::new("m1", "c1", at(0));
        meeting.start_location = Some(GpsPoint::new(0.0, f64::INFINITY));
        snapshot.meetings = vec![meeting];
        snapshot.clients = vec![
            ClientLocation::new("c1", "Acme", Some(GpsPoint::new(0.0, 181.0))),
            ClientLocation::new("c2", "Bharat", Some(GpsPoint::new(1.0, 1.0))),
        ];

        assert_eq!(snapshot.invalid_coordinate_count(), 4);
        assert_eq!(snapshot.sanitize(), 4);
        assert_eq!(snapshot.invalid_coordinate_count(), 0);

        let times: Vec<_> = snapshot.pings.iter().map(|p| p.timestamp).collect();
        assert_eq!(times, vec![at(0), at(10)]);
        assert_eq!(snapshot.meetings[0].start_location, None);
        assert_eq!(snapshot.clients[0].location, None);
        assert_eq!(snapshot.clients[1].location, Some(GpsPoint::new(1.0, 1.0)));
    }

    #[test]
    fn test_sanitize_leaves_clean_snapshot_alone() {
        let mut snapshot = JourneySnapshot::new("agent-1");
        snapshot.pings = vec![Ping::new(at(0), 12.97, 77.59)];
        let before = snapshot.clone();

        assert_eq!(snapshot.sanitize(), 0);
        assert_eq!(snapshot, before);
    }
}
