//! The event aggregate.
//!
//! An [`Event`] collects every prefix-event record sharing a type and view
//! timestamp, in arrival order. It is finished iff it holds a `FINISHED`
//! record, and a finished event refuses further records.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{EventError, IntegrityError};
use crate::record::{AsPath, EventId, EventType, PrefixEventRecord, RecordDetails};

/// Tag marking events that repeat an already-reported anomaly. Retagging
/// leaves them untouched.
pub const TAG_RECURRING: &str = "recurring-pfx-event";

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RFC 3339 rendering of a unix timestamp for log lines.
pub fn format_ts(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map_or_else(|| ts.to_string(), |dt| dt.to_rfc3339())
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// One inference verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inference {
    pub inference_id: String,
    pub suspicion_level: i32,
    pub confidence: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub primary_inference: Option<Inference>,
    #[serde(default)]
    pub inferences: Vec<Inference>,
}

/// Derived classification state. Opaque to assembly; owned by taggers and
/// inference engines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSummary {
    pub tags: BTreeSet<String>,
    pub prefixes: BTreeSet<String>,
    pub ases: BTreeSet<u32>,
    pub inference_result: Option<InferenceResult>,
}

impl EventSummary {
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    pub fn clear_inference(&mut self) {
        self.inference_result = None;
    }

    /// True when a primary inference has been recorded.
    #[must_use]
    pub fn has_inference(&self) -> bool {
        self.inference_result
            .as_ref()
            .is_some_and(|r| r.primary_inference.is_some())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An assembled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EventDocument")]
pub struct Event {
    #[serde(rename = "id")]
    event_id: EventId,
    event_type: EventType,
    view_ts: u64,
    insert_ts: u64,
    last_modified_ts: u64,
    finished: bool,
    pfx_events: Vec<PrefixEventRecord>,
    pub summary: EventSummary,
}

/// Wire shape used to rebuild an [`Event`] with its invariants checked.
#[derive(Deserialize)]
struct EventDocument {
    id: EventId,
    event_type: EventType,
    view_ts: u64,
    insert_ts: u64,
    last_modified_ts: u64,
    #[serde(default)]
    pfx_events: Vec<PrefixEventRecord>,
    #[serde(default)]
    summary: EventSummary,
}

impl TryFrom<EventDocument> for Event {
    type Error = EventError;

    fn try_from(doc: EventDocument) -> Result<Self, Self::Error> {
        if doc.id.event_type != doc.event_type || doc.id.view_ts != doc.view_ts {
            return Err(EventError::KeyMismatch {
                expected: doc.id.to_string(),
                found: format!("{}-{}", doc.event_type, doc.view_ts),
            });
        }
        let mut event = Self::empty(doc.id, doc.insert_ts);
        event.last_modified_ts = doc.last_modified_ts;
        for record in doc.pfx_events {
            event.push_record(record)?;
        }
        event.summary = doc.summary;
        Ok(event)
    }
}

impl Event {
    fn empty(event_id: EventId, insert_ts: u64) -> Self {
        Self {
            event_id,
            event_type: event_id.event_type,
            view_ts: event_id.view_ts,
            insert_ts,
            last_modified_ts: insert_ts,
            finished: false,
            pfx_events: Vec::new(),
            summary: EventSummary::default(),
        }
    }

    /// Create an event seeded from its first record.
    #[must_use]
    pub fn from_record(record: PrefixEventRecord) -> Self {
        let mut event = Self::empty(record.event_key(), unix_now());
        event.accept(record);
        event
    }

    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    #[must_use]
    pub fn view_ts(&self) -> u64 {
        self.view_ts
    }

    #[must_use]
    pub fn insert_ts(&self) -> u64 {
        self.insert_ts
    }

    #[must_use]
    pub fn last_modified_ts(&self) -> u64 {
        self.last_modified_ts
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Records in arrival order.
    #[must_use]
    pub fn records(&self) -> &[PrefixEventRecord] {
        &self.pfx_events
    }

    /// Stamp the modification time; called right before a write.
    pub fn touch(&mut self) {
        self.last_modified_ts = unix_now().max(self.insert_ts);
    }

    /// Append a record.
    ///
    /// Rejects records for another key, records arriving after the event
    /// finished, and exact duplicates of a record already held.
    pub fn push_record(&mut self, record: PrefixEventRecord) -> Result<(), EventError> {
        if record.event_key() != self.event_id {
            return Err(EventError::KeyMismatch {
                expected: self.event_id.to_string(),
                found: record.event_key().to_string(),
            });
        }
        if self.finished {
            return Err(EventError::AlreadyFinished {
                event_id: self.event_id.to_string(),
                fingerprint: record.fingerprint(),
            });
        }
        if self.pfx_events.contains(&record) {
            return Err(EventError::DuplicateRecord {
                event_id: self.event_id.to_string(),
                fingerprint: record.fingerprint(),
            });
        }
        self.accept(record);
        Ok(())
    }

    fn accept(&mut self, record: PrefixEventRecord) {
        for prefix in record.details.prefixes() {
            self.summary.prefixes.insert(prefix.to_string());
        }
        self.summary.ases.extend(record.details.ases());
        self.finished |= record.is_finished();
        self.pfx_events.push(record);
    }

    /// Append every record of `other` after this event's own records.
    ///
    /// Duplicates are dropped. Returns the number of records taken; stops at
    /// the first record refused because this event already finished.
    pub fn absorb(&mut self, other: Self) -> Result<usize, EventError> {
        if other.event_id != self.event_id {
            return Err(EventError::KeyMismatch {
                expected: self.event_id.to_string(),
                found: other.event_id.to_string(),
            });
        }
        let mut taken = 0;
        for record in other.pfx_events {
            match self.push_record(record) {
                Ok(()) => taken += 1,
                Err(EventError::DuplicateRecord { .. }) => {}
                Err(err @ EventError::AlreadyFinished { .. }) => {
                    tracing::warn!(event_id = %self.event_id, error = %err, "dropping records after FINISHED");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(taken)
    }

    /// Check that recorded origins agree with the recorded AS-path endpoints.
    ///
    /// Only sub-prefix MOAS events carry both sets independently; other
    /// types are consistent by construction.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        for record in &self.pfx_events {
            if let RecordDetails::Submoas {
                sub_prefix,
                super_prefix,
                sub_origins,
                super_origins,
                sub_aspaths,
                super_aspaths,
            } = &record.details
            {
                for (prefix, origins, paths) in [
                    (sub_prefix, sub_origins, sub_aspaths),
                    (super_prefix, super_origins, super_aspaths),
                ] {
                    if *origins != path_origins(paths) {
                        return Err(IntegrityError::OriginPathMismatch {
                            event_id: self.event_id.to_string(),
                            prefix: prefix.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Size of the JSON document written to the index.
    pub fn document_size(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|v| v.len())
    }
}

fn path_origins(paths: &[AsPath]) -> BTreeSet<u32> {
    paths.iter().filter_map(|p| p.last().copied()).collect()
}
