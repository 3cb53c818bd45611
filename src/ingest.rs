//! Ingestion boundary: backend wire records to canonical records.
//!
//! Backend payloads have drifted across versions (`distanceKm` vs
//! `distance_km`, `receiptImages` vs `receiptUrls`, numbers sent as strings,
//! ISO strings vs epoch milliseconds). All of that is absorbed here so the
//! engine components only ever see the canonical types in [`crate::types`].
//!
//! Rules applied by [`Normalizer`]:
//! - pings with an unparseable timestamp or unusable coordinates are dropped
//! - meetings with an unparseable start time are dropped; unusable check-in
//!   coordinates are cleared
//! - clients with unusable coordinates keep the record but lose the location
//!   (which disables visit verification for them)
//! - expenses with an unparseable travel date are dropped; non-numeric amounts
//!   count as zero

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{JourneyError, Result};
use crate::types::{ClientLocation, ExpenseLeg, ExpenseRecord, Meeting, Ping};
use crate::GpsPoint;

// ============================================================================
// Lenient scalar types
// ============================================================================

/// A number that may arrive as a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Number(f64),
    Text(String),
}

impl RawNumber {
    /// Finite value, if any.
    pub fn to_f64(&self) -> Option<f64> {
        let value = match self {
            RawNumber::Number(n) => *n,
            RawNumber::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

/// An identifier or code that may arrive as a string or a number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawText {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl RawText {
    pub fn into_string(self) -> String {
        match self {
            RawText::Integer(n) => n.to_string(),
            RawText::Number(n) => n.to_string(),
            RawText::Text(s) => s.trim().to_string(),
        }
    }
}

/// A point in time as ISO-8601 text or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawTime {
    Millis(i64),
    Float(f64),
    Text(String),
}

impl RawTime {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTime::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            RawTime::Float(ms) if ms.is_finite() => DateTime::from_timestamp_millis(*ms as i64),
            RawTime::Float(_) => None,
            RawTime::Text(s) => parse_timestamp(s),
        }
    }
}

/// Parse the timestamp formats seen in backend payloads.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` and `YYYY-MM-DDTHH:MM:SS[.fff]`
/// (both read as UTC), `YYYY-MM-DD` (UTC midnight) and epoch milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis);
    }
    None
}

/// Coordinates as a valid point, or an error describing what is wrong.
pub fn checked_point(
    record_id: &str,
    lat: Option<&RawNumber>,
    lng: Option<&RawNumber>,
) -> Result<GpsPoint> {
    let invalid = |message: &str| JourneyError::InvalidCoordinates {
        record_id: record_id.to_string(),
        message: message.to_string(),
    };

    let (Some(lat), Some(lng)) = (lat, lng) else {
        return Err(invalid("missing latitude or longitude"));
    };
    let (Some(lat), Some(lng)) = (lat.to_f64(), lng.to_f64()) else {
        return Err(invalid("not a finite number"));
    };
    let point = GpsPoint::new(lat, lng);
    if !point.is_valid() {
        return Err(invalid("out of range"));
    }
    Ok(point)
}

fn point_from(
    record_id: &str,
    lat: Option<&RawNumber>,
    lng: Option<&RawNumber>,
) -> Option<GpsPoint> {
    checked_point(record_id, lat, lng)
        .map_err(|e| debug!("[Normalizer] {}", e))
        .ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// ============================================================================
// Wire records
// ============================================================================

/// Location ping as sent by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRecord {
    #[serde(alias = "lat")]
    pub latitude: Option<RawNumber>,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: Option<RawNumber>,
    #[serde(alias = "time", alias = "recorded_at", alias = "recordedAt")]
    pub timestamp: Option<RawTime>,
    pub accuracy: Option<RawNumber>,
    #[serde(alias = "batteryLevel", alias = "battery_level")]
    pub battery: Option<RawNumber>,
    #[serde(alias = "regionCode", alias = "region_code", alias = "pinCode")]
    pub pincode: Option<RawText>,
    pub activity: Option<String>,
}

/// Scheduled meeting as sent by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingRecord {
    #[serde(alias = "_id", alias = "meetingId", alias = "meeting_id")]
    pub id: Option<RawText>,
    #[serde(alias = "client_id")]
    pub client_id: Option<RawText>,
    #[serde(alias = "client_name")]
    pub client_name: Option<String>,
    #[serde(alias = "start_time")]
    pub start_time: Option<RawTime>,
    #[serde(alias = "end_time")]
    pub end_time: Option<RawTime>,
    #[serde(alias = "start_latitude")]
    pub start_latitude: Option<RawNumber>,
    #[serde(alias = "start_longitude")]
    pub start_longitude: Option<RawNumber>,
    pub status: Option<String>,
    pub comments: Option<String>,
    #[serde(alias = "attachmentUrls", alias = "attachment_urls")]
    pub attachments: Option<Vec<String>>,
}

/// Client as sent by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientRecord {
    #[serde(alias = "_id", alias = "clientId")]
    pub id: Option<RawText>,
    #[serde(alias = "clientName")]
    pub name: Option<String>,
    #[serde(alias = "lat")]
    pub latitude: Option<RawNumber>,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: Option<RawNumber>,
    pub status: Option<String>,
    #[serde(alias = "regionCode", alias = "region_code", alias = "pinCode")]
    pub pincode: Option<RawText>,
    #[serde(alias = "createdAt")]
    pub created_at: Option<RawTime>,
}

/// One leg of a multi-stop expense claim as sent by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseLegRecord {
    #[serde(alias = "startLocation", alias = "start_location")]
    pub from: Option<String>,
    #[serde(alias = "endLocation", alias = "end_location")]
    pub to: Option<String>,
    #[serde(alias = "distance_km", alias = "distance")]
    pub distance_km: Option<RawNumber>,
    #[serde(alias = "transport_mode")]
    pub transport_mode: Option<String>,
}

/// Travel expense as sent by the backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseRecordWire {
    #[serde(alias = "distance_km")]
    pub distance_km: Option<RawNumber>,
    #[serde(alias = "amount_spent", alias = "amount")]
    pub amount_spent: Option<RawNumber>,
    #[serde(alias = "travel_date")]
    pub travel_date: Option<RawTime>,
    #[serde(alias = "transport_mode")]
    pub transport_mode: Option<String>,
    #[serde(alias = "start_location")]
    pub start_location: Option<String>,
    #[serde(alias = "end_location")]
    pub end_location: Option<String>,
    pub legs: Option<Vec<ExpenseLegRecord>>,
    #[serde(alias = "receiptUrls", alias = "receipt_images", alias = "receipt_urls")]
    pub receipt_images: Option<Vec<String>>,
}

/// Parse a JSON collection body: either a bare array or `{"data": [...]}`.
pub fn parse_collection<T: DeserializeOwned>(source_name: &str, body: &str) -> Result<Vec<T>> {
    let unavailable = |message: String| JourneyError::DataUnavailable {
        source_name: source_name.to_string(),
        message,
    };

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| unavailable(format!("Malformed JSON: {}", e)))?;

    let array = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut map) => match map.remove("data") {
            Some(data @ serde_json::Value::Array(_)) => data,
            _ => return Err(unavailable("Expected an array or a 'data' array".to_string())),
        },
        _ => return Err(unavailable("Expected an array or a 'data' array".to_string())),
    };

    serde_json::from_value(array)
        .map_err(|e| unavailable(format!("Unexpected record shape: {}", e)))
}

// ============================================================================
// Normalizer
// ============================================================================

/// Per-collection ingestion counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub accepted: usize,
    pub dropped: usize,
    /// Kept, but with an unusable field cleared or defaulted
    pub repaired: usize,
}

/// What the normalizer accepted, dropped and repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub pings: CollectionReport,
    pub meetings: CollectionReport,
    pub clients: CollectionReport,
    pub expenses: CollectionReport,
}

/// Converts wire records to canonical records, counting what it had to fix.
#[derive(Debug, Default)]
pub struct Normalizer {
    report: IngestReport,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> IngestReport {
        self.report
    }

    pub fn pings(&mut self, records: Vec<PingRecord>) -> Vec<Ping> {
        let total = records.len();
        let out: Vec<Ping> = records
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| {
                let timestamp = r.timestamp.as_ref().and_then(RawTime::to_datetime)?;
                let record_id = format!("ping #{} @ {}", i, timestamp.to_rfc3339());
                let location = point_from(&record_id, r.latitude.as_ref(), r.longitude.as_ref())?;
                Some(Ping {
                    timestamp,
                    location,
                    accuracy: r.accuracy.as_ref().and_then(RawNumber::to_f64),
                    battery: r.battery.as_ref().and_then(RawNumber::to_f64),
                    region_code: r.pincode.map(RawText::into_string).filter(|s| !s.is_empty()),
                    activity: non_empty(r.activity),
                })
            })
            .collect();

        self.record("pings", total, out.len(), 0, |r| &mut r.pings);
        out
    }

    pub fn meetings(&mut self, records: Vec<MeetingRecord>) -> Vec<Meeting> {
        let total = records.len();
        let mut repaired = 0;
        let out: Vec<Meeting> = records
            .into_iter()
            .filter_map(|r| {
                let start_time = r.start_time.as_ref().and_then(RawTime::to_datetime)?;
                let id = r.id.map(RawText::into_string).unwrap_or_default();
                let had_coordinates = r.start_latitude.is_some() || r.start_longitude.is_some();
                let start_location = if had_coordinates {
                    point_from(&id, r.start_latitude.as_ref(), r.start_longitude.as_ref())
                } else {
                    None
                };
                let end_time = r.end_time.as_ref().and_then(RawTime::to_datetime);
                let bad_end = r.end_time.is_some() && end_time.is_none();
                if (had_coordinates && start_location.is_none()) || bad_end {
                    repaired += 1;
                }

                Some(Meeting {
                    id,
                    client_id: r.client_id.map(RawText::into_string).filter(|s| !s.is_empty()),
                    client_name: non_empty(r.client_name),
                    start_time,
                    end_time,
                    start_location,
                    status: r.status.unwrap_or_default(),
                    comments: non_empty(r.comments),
                    attachments: r.attachments.unwrap_or_default(),
                })
            })
            .collect();

        self.record("meetings", total, out.len(), repaired, |r| &mut r.meetings);
        out
    }

    pub fn clients(&mut self, records: Vec<ClientRecord>) -> Vec<ClientLocation> {
        let total = records.len();
        let mut repaired = 0;
        let out: Vec<ClientLocation> = records
            .into_iter()
            .map(|r| {
                let id = r.id.map(RawText::into_string).unwrap_or_default();
                let had_coordinates = r.latitude.is_some() || r.longitude.is_some();
                let location = if had_coordinates {
                    point_from(&id, r.latitude.as_ref(), r.longitude.as_ref())
                } else {
                    None
                };
                if had_coordinates && location.is_none() {
                    repaired += 1;
                }

                ClientLocation {
                    id,
                    name: r.name.map(|n| n.trim().to_string()).unwrap_or_default(),
                    location,
                    status: r.status.unwrap_or_default(),
                    region_code: r.pincode.map(RawText::into_string).filter(|s| !s.is_empty()),
                    created_at: r.created_at.as_ref().and_then(RawTime::to_datetime),
                }
            })
            .collect();

        self.record("clients", total, out.len(), repaired, |r| &mut r.clients);
        out
    }

    pub fn expenses(&mut self, records: Vec<ExpenseRecordWire>) -> Vec<ExpenseRecord> {
        let total = records.len();
        let mut repaired = 0;
        let out: Vec<ExpenseRecord> = records
            .into_iter()
            .filter_map(|r| {
                let travel_date = r.travel_date.as_ref().and_then(RawTime::to_datetime)?;
                let distance_km = r.distance_km.as_ref().and_then(RawNumber::to_f64);
                let amount_spent = r.amount_spent.as_ref().and_then(RawNumber::to_f64);
                if distance_km.is_none() || amount_spent.is_none() {
                    repaired += 1;
                }

                Some(ExpenseRecord {
                    travel_date,
                    distance_km: distance_km.unwrap_or(0.0).max(0.0),
                    amount_spent: amount_spent.unwrap_or(0.0),
                    transport_mode: r.transport_mode.unwrap_or_default(),
                    start_location: r.start_location.unwrap_or_default(),
                    end_location: r.end_location.unwrap_or_default(),
                    legs: r
                        .legs
                        .unwrap_or_default()
                        .into_iter()
                        .map(|leg| ExpenseLeg {
                            from: leg.from.unwrap_or_default(),
                            to: leg.to.unwrap_or_default(),
                            distance_km: leg
                                .distance_km
                                .as_ref()
                                .and_then(RawNumber::to_f64)
                                .unwrap_or(0.0),
                            transport_mode: non_empty(leg.transport_mode),
                        })
                        .collect(),
                    receipt_images: r.receipt_images.unwrap_or_default(),
                })
            })
            .collect();

        self.record("expenses", total, out.len(), repaired, |r| &mut r.expenses);
        out
    }

    fn record(
        &mut self,
        name: &str,
        total: usize,
        accepted: usize,
        repaired: usize,
        slot: impl FnOnce(&mut IngestReport) -> &mut CollectionReport,
    ) {
        let dropped = total - accepted;
        let entry = slot(&mut self.report);
        entry.accepted += accepted;
        entry.dropped += dropped;
        entry.repaired += repaired;

        if dropped > 0 {
            warn!(
                "[Normalizer] Dropped {} of {} {} record(s) with bad timestamps or coordinates",
                dropped, total, name
            );
        }
        if repaired > 0 {
            debug!("[Normalizer] Repaired {} {} record(s)", repaired, name);
        }
    }
}
