//! Unified error handling for the journey-matcher library.
//!
//! Every fallible operation in the crate returns [`Result`]. Malformed upstream
//! data (bad timestamps, non-finite coordinates) is filtered at the ingestion
//! boundary and never surfaces here; only conditions the caller must act on do.

use thiserror::Error;

/// Unified error type for journey-matcher operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JourneyError {
    /// Meetings were supplied for matching but there are no pings to match against
    #[error("Cannot match {meeting_count} meeting(s) against an empty ping set")]
    EmptyPingSet { meeting_count: usize },

    /// A record carried coordinates that are not finite or out of WGS84 range
    #[error("Record '{record_id}' has invalid coordinates: {message}")]
    InvalidCoordinates { record_id: String, message: String },

    /// Date range whose start is after its end
    #[error("Invalid date range: {start} is after {end}")]
    InvalidDateRange { start: String, end: String },

    /// A collaborator could not provide a collection and no cached copy exists
    #[error("Data unavailable from '{source_name}': {message}")]
    DataUnavailable { source_name: String, message: String },

    /// HTTP/API error
    #[error(
        "HTTP error{}: {message}",
        .status_code.map(|c| format!(" ({})", c)).unwrap_or_default()
    )]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for journey-matcher operations.
pub type Result<T> = std::result::Result<T, JourneyError>;

/// Extension trait for converting Option to JourneyError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a data-unavailable error.
    fn ok_or_unavailable(self, source_name: &str, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unavailable(self, source_name: &str, message: &str) -> Result<T> {
        self.ok_or_else(|| JourneyError::DataUnavailable {
            source_name: source_name.to_string(),
            message: message.to_string(),
        })
    }
}
