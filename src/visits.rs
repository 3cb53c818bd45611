//! Visit matching and geospatial verification.
//!
//! Each scheduled meeting is paired with:
//! 1. its client record (by id, falling back to a case-insensitive name match),
//! 2. the ping closest in time to the meeting start,
//! 3. the distance from that ping to the client's declared location.
//!
//! A visit is *verified* when that distance exists and is strictly below the
//! configured radius (0.5 km by default).
//!
//! ## Nearest-ping tie-break
//!
//! When two pings are exactly equidistant in time from the meeting start, the
//! earlier ping wins. Among pings sharing one timestamp, the first in sequence
//! wins.

use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::VerificationConfig;
use crate::error::{JourneyError, Result};
use crate::geo_utils::haversine_distance_km;
use crate::types::{ClientLocation, Meeting, Ping};
use crate::{Geotagged, GpsPoint};

/// Whether the agent has checked out of the meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitStatus {
    Completed,
    InProgress,
}

impl VisitStatus {
    pub fn for_meeting(meeting: &Meeting) -> Self {
        if meeting.is_completed() {
            VisitStatus::Completed
        } else {
            VisitStatus::InProgress
        }
    }

    /// Human-readable label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            VisitStatus::Completed => "Completed",
            VisitStatus::InProgress => "In Progress",
        }
    }
}

/// A meeting paired with its client, closest ping and verification outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub meeting: Meeting,
    pub matched_client: Option<ClientLocation>,
    pub closest_ping: Ping,
    pub visit_status: VisitStatus,
    /// `None` when the client is unknown or has no declared location
    pub distance_to_client_km: Option<f64>,
    pub verified: bool,
}

impl VisitRecord {
    /// Minutes between check-in and check-out, `None` while in progress.
    pub fn duration_minutes(&self) -> Option<i64> {
        self.meeting
            .end_time
            .map(|end| (end - self.meeting.start_time).num_minutes().max(0))
    }

    /// Client name from the matched record, else the name the meeting carried.
    pub fn client_name(&self) -> &str {
        self.matched_client
            .as_ref()
            .map(|c| c.name.as_str())
            .or(self.meeting.client_name.as_deref())
            .unwrap_or("")
    }
}

impl Geotagged for VisitRecord {
    /// Check-in point, else where the agent was at the meeting start.
    fn position(&self) -> Option<GpsPoint> {
        self.meeting
            .start_location
            .or(Some(self.closest_ping.location))
    }
}

/// Lookup of clients by id and by normalized name.
pub struct ClientIndex<'a> {
    by_id: HashMap<&'a str, &'a ClientLocation>,
    by_name: HashMap<String, &'a ClientLocation>,
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

impl<'a> ClientIndex<'a> {
    /// Build the index. On duplicate ids or names the first record wins.
    pub fn new(clients: &'a [ClientLocation]) -> Self {
        let mut by_id = HashMap::with_capacity(clients.len());
        let mut by_name = HashMap::with_capacity(clients.len());
        for client in clients {
            by_id.entry(client.id.as_str()).or_insert(client);
            let name = normalize_name(&client.name);
            if !name.is_empty() {
                by_name.entry(name).or_insert(client);
            }
        }
        Self { by_id, by_name }
    }

    /// Resolve the meeting's client by id, then by name.
    pub fn resolve(&self, meeting: &Meeting) -> Option<&'a ClientLocation> {
        meeting
            .client_id
            .as_deref()
            .and_then(|id| self.by_id.get(id).copied())
            .or_else(|| {
                meeting
                    .client_name
                    .as_deref()
                    .map(normalize_name)
                    .filter(|n| !n.is_empty())
                    .and_then(|n| self.by_name.get(&n).copied())
            })
    }
}

/// Index of the ping closest in time to `target` in a sorted sequence.
///
/// Returns `None` only for an empty slice.
pub fn closest_ping_index(pings: &[Ping], target: DateTime<Utc>) -> Option<usize> {
    if pings.is_empty() {
        return None;
    }

    // First ping at or after the target
    let after = pings.partition_point(|p| p.timestamp < target);
    if after == 0 {
        return Some(0);
    }

    let before_ts = pings[after - 1].timestamp;
    let before = pings.partition_point(|p| p.timestamp < before_ts);
    if after == pings.len() {
        return Some(before);
    }

    let before_gap = target - before_ts;
    let after_gap = pings[after].timestamp - target;
    if before_gap <= after_gap {
        Some(before)
    } else {
        Some(after)
    }
}

/// Match every meeting against sorted pings and the client collection.
///
/// Returns an empty list when there are no meetings. Fails with
/// [`JourneyError::EmptyPingSet`] when there are meetings but no pings.
pub fn match_visits(
    meetings: &[Meeting],
    pings: &[Ping],
    clients: &[ClientLocation],
    config: &VerificationConfig,
) -> Result<Vec<VisitRecord>> {
    if meetings.is_empty() {
        return Ok(Vec::new());
    }
    if pings.is_empty() {
        return Err(JourneyError::EmptyPingSet {
            meeting_count: meetings.len(),
        });
    }

    let pings: Cow<'_, [Ping]> = if pings.windows(2).all(|w| w[0].timestamp <= w[1].timestamp) {
        Cow::Borrowed(pings)
    } else {
        warn!("[VisitMatcher] Received unsorted pings; sorting before matching");
        let mut owned = pings.to_vec();
        owned.sort_by_key(|p| p.timestamp);
        Cow::Owned(owned)
    };

    let index = ClientIndex::new(clients);
    let mut records = Vec::with_capacity(meetings.len());

    for meeting in meetings {
        let closest_ping = match closest_ping_index(&pings, meeting.start_time) {
            Some(i) => pings[i].clone(),
            None => {
                return Err(JourneyError::EmptyPingSet {
                    meeting_count: meetings.len(),
                })
            }
        };

        let matched_client = index.resolve(meeting).cloned();
        let distance_to_client_km = matched_client
            .as_ref()
            .and_then(|c| c.location)
            .map(|loc| haversine_distance_km(&closest_ping.location, &loc));
        let verified = distance_to_client_km.is_some_and(|d| d < config.radius_km);

        if matched_client.is_none() {
            debug!(
                "[VisitMatcher] Meeting '{}' has no matching client record",
                meeting.id
            );
        }

        records.push(VisitRecord {
            meeting: meeting.clone(),
            matched_client,
            closest_ping,
            visit_status: VisitStatus::for_meeting(meeting),
            distance_to_client_km,
            verified,
        });
    }

    debug!(
        "[VisitMatcher] Matched {} meetings against {} pings ({} verified)",
        records.len(),
        pings.len(),
        records.iter().filter(|r| r.verified).count()
    );

    Ok(records)
}
