//! Prefix-event records and the identifiers derived from them.
//!
//! A [`PrefixEventRecord`] is one parsed observation line: the state of a
//! single prefix (or prefix pair) at a view timestamp. Records sharing an
//! [`EventId`] (`{type}-{view_ts}`) belong to the same [`crate::event::Event`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ParseError;

// ---------------------------------------------------------------------------
// Event type
// ---------------------------------------------------------------------------

/// Kind of routing anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Moas,
    Submoas,
    Defcon,
    Edges,
}

impl EventType {
    pub const ALL: [Self; 4] = [Self::Moas, Self::Submoas, Self::Defcon, Self::Edges];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Moas => "moas",
            Self::Submoas => "submoas",
            Self::Defcon => "defcon",
            Self::Edges => "edges",
        }
    }

    /// Object-store container holding this type's observation files.
    #[must_use]
    pub fn container(self) -> String {
        format!("bgp-hijacks-{}", self.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "moas" => Ok(Self::Moas),
            "submoas" => Ok(Self::Submoas),
            "defcon" => Ok(Self::Defcon),
            "edges" => Ok(Self::Edges),
            _ => Err(ParseError::UnknownEventType(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Where a record sits in its event's lifetime. `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Position {
    New,
    Ongoing,
    Finished,
}

impl Position {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Ongoing => "ONGOING",
            Self::Finished => "FINISHED",
        }
    }

    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Position {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "ONGOING" => Ok(Self::Ongoing),
            "FINISHED" => Ok(Self::Finished),
            _ => Err(ParseError::InvalidPosition(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Event id
// ---------------------------------------------------------------------------

/// Event key: `{type}-{view_ts}`.
///
/// Ordering is by `(event_type, view_ts)`, so within one type the smallest key
/// is the oldest open event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    pub event_type: EventType,
    pub view_ts: u64,
}

impl EventId {
    #[must_use]
    pub fn new(event_type: EventType, view_ts: u64) -> Self {
        Self {
            event_type,
            view_ts,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.event_type, self.view_ts)
    }
}

impl FromStr for EventId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, ts) = s
            .split_once('-')
            .ok_or_else(|| ParseError::InvalidTimestamp(s.to_string()))?;
        let event_type = kind.parse()?;
        let view_ts = ts
            .parse()
            .map_err(|_| ParseError::InvalidTimestamp(ts.to_string()))?;
        Ok(Self::new(event_type, view_ts))
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Record payloads
// ---------------------------------------------------------------------------

/// An AS path, first hop to origin.
pub type AsPath = Vec<u32>;

/// Type-specific payload of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RecordDetails {
    Moas {
        prefix: String,
        origins: BTreeSet<u32>,
        old_origins: BTreeSet<u32>,
        aspaths: Vec<AsPath>,
    },
    Submoas {
        sub_prefix: String,
        super_prefix: String,
        sub_origins: BTreeSet<u32>,
        super_origins: BTreeSet<u32>,
        sub_aspaths: Vec<AsPath>,
        super_aspaths: Vec<AsPath>,
    },
    Defcon {
        sub_prefix: String,
        super_prefix: String,
        origins: BTreeSet<u32>,
        sub_aspaths: Vec<AsPath>,
        super_aspaths: Vec<AsPath>,
    },
    Edges {
        prefix: String,
        as1: u32,
        as2: u32,
        aspaths: Vec<AsPath>,
    },
}

impl RecordDetails {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Moas { .. } => EventType::Moas,
            Self::Submoas { .. } => EventType::Submoas,
            Self::Defcon { .. } => EventType::Defcon,
            Self::Edges { .. } => EventType::Edges,
        }
    }

    /// Prefixes named by this record.
    #[must_use]
    pub fn prefixes(&self) -> Vec<&str> {
        match self {
            Self::Moas { prefix, .. } | Self::Edges { prefix, .. } => vec![prefix.as_str()],
            Self::Submoas {
                sub_prefix,
                super_prefix,
                ..
            }
            | Self::Defcon {
                sub_prefix,
                super_prefix,
                ..
            } => vec![sub_prefix.as_str(), super_prefix.as_str()],
        }
    }

    /// ASes currently involved (origins, or edge endpoints).
    #[must_use]
    pub fn ases(&self) -> BTreeSet<u32> {
        match self {
            Self::Moas { origins, .. } | Self::Defcon { origins, .. } => origins.clone(),
            Self::Submoas {
                sub_origins,
                super_origins,
                ..
            } => sub_origins.union(super_origins).copied().collect(),
            Self::Edges { as1, as2, .. } => [*as1, *as2].into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// PrefixEventRecord
// ---------------------------------------------------------------------------

/// One parsed observation line. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixEventRecord {
    pub view_ts: u64,
    pub position: Position,
    pub details: RecordDetails,
}

impl PrefixEventRecord {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.details.event_type()
    }

    /// Key of the event this record belongs to.
    #[must_use]
    pub fn event_key(&self) -> EventId {
        EventId::new(self.event_type(), self.view_ts)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.position.is_finished()
    }

    /// Stable rendering of the involved prefixes and ASes, e.g.
    /// `10.0.0.0/8:64500_64501`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let ases: Vec<String> = self.details.ases().iter().map(u32::to_string).collect();
        format!("{}:{}", self.details.prefixes().join("="), ases.join("_"))
    }
}
