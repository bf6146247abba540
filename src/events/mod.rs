//! Staged webhook events.
//!
//! Every accepted webhook becomes one durable [`Event`] record keyed by a
//! server-generated id. The record carries the raw payload plus the small
//! envelope the pipeline needs: source, event type, external id, and the
//! idempotency key fingerprinting the business event.

pub mod store;

pub use store::EventStore;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Calendar,
    MeetingTranscript,
    SupportTag,
    SupportCompany,
    ManualEnrich,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Calendar => "calendar",
            EventSource::MeetingTranscript => "meeting_transcript",
            EventSource::SupportTag => "support_tag",
            EventSource::SupportCompany => "support_company",
            EventSource::ManualEnrich => "manual_enrich",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "calendar" => Some(EventSource::Calendar),
            "meeting_transcript" => Some(EventSource::MeetingTranscript),
            "support_tag" => Some(EventSource::SupportTag),
            "support_company" => Some(EventSource::SupportCompany),
            "manual_enrich" => Some(EventSource::ManualEnrich),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle: `queued -> processing -> (processed | ignored | failed)`.
/// The three right-hand states are terminal; the runner never resurrects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Processing,
    Processed,
    Ignored,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Ignored => "ignored",
            EventStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(EventStatus::Queued),
            "processing" => Some(EventStatus::Processing),
            "processed" => Some(EventStatus::Processed),
            "ignored" => Some(EventStatus::Ignored),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Processed | EventStatus::Ignored | EventStatus::Failed
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durably staged webhook event.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: String,
    pub source: EventSource,
    pub event_type: String,
    pub external_id: String,
    pub idempotency_key: String,
    pub status: EventStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Raw incoming body, kept opaque for the handlers to interpret.
    pub payload: serde_json::Value,
}

/// The fingerprint of a business event: `"{source}:{event_type}:{external_id}"`.
pub fn idempotency_key(source: EventSource, event_type: &str, external_id: &str) -> String {
    format!("{}:{}:{}", source.as_str(), event_type, external_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_roundtrip() {
        for s in [
            EventSource::Calendar,
            EventSource::MeetingTranscript,
            EventSource::SupportTag,
            EventSource::SupportCompany,
            EventSource::ManualEnrich,
        ] {
            assert_eq!(EventSource::from_str(s.as_str()), Some(s));
        }
        assert_eq!(EventSource::from_str("smoke_signal"), None);
    }

    #[test]
    fn status_terminality() {
        assert!(!EventStatus::Queued.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
        assert!(EventStatus::Processed.is_terminal());
        assert!(EventStatus::Ignored.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
    }

    #[test]
    fn fingerprint_format() {
        assert_eq!(
            idempotency_key(EventSource::Calendar, "booked", "evt-123"),
            "calendar:booked:evt-123"
        );
    }
}
