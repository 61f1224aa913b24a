//! Line parser for observation files.
//!
//! Every data line starts with `view_ts|position|`, followed by the
//! type-specific fields:
//!
//! ```text
//! moas     prefix|origins|old_origins|aspaths
//! submoas  sub_prefix|super_prefix|sub_origins|super_origins|sub_aspaths|super_aspaths
//! defcon   sub_prefix|super_prefix|origins|sub_aspaths|super_aspaths
//! edges    prefix|as1|as2|aspaths
//! ```
//!
//! ASN sets are space separated. AS-path lists are `:` separated with hops
//! separated by spaces. An empty field is an empty list.

use std::collections::BTreeSet;

use crate::error::ParseError;
use crate::record::{AsPath, EventType, Position, PrefixEventRecord, RecordDetails};

/// Stateless parser bound to one event type.
#[derive(Debug, Clone, Copy)]
pub struct PrefixRecordParser {
    event_type: EventType,
}

impl PrefixRecordParser {
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self { event_type }
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Parse one line.
    ///
    /// Returns `Ok(None)` for `#` comments and blank lines. Any other line
    /// that does not match the schema is an error; callers must not skip it.
    pub fn parse(&self, line: &str) -> Result<Option<PrefixEventRecord>, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let fields: Vec<&str> = line.split('|').collect();
        let expected = 2 + self.payload_field_count();
        if fields.len() != expected {
            return Err(ParseError::FieldCount {
                expected,
                found: fields.len(),
            });
        }

        let view_ts = fields[0]
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidTimestamp(fields[0].to_string()))?;
        let position: Position = fields[1].trim().parse()?;
        let rest = &fields[2..];

        let details = match self.event_type {
            EventType::Moas => RecordDetails::Moas {
                prefix: parse_prefix(rest[0])?,
                origins: parse_asn_set(rest[1])?,
                old_origins: parse_asn_set(rest[2])?,
                aspaths: parse_paths(rest[3])?,
            },
            EventType::Submoas => RecordDetails::Submoas {
                sub_prefix: parse_prefix(rest[0])?,
                super_prefix: parse_prefix(rest[1])?,
                sub_origins: parse_asn_set(rest[2])?,
                super_origins: parse_asn_set(rest[3])?,
                sub_aspaths: parse_paths(rest[4])?,
                super_aspaths: parse_paths(rest[5])?,
            },
            EventType::Defcon => RecordDetails::Defcon {
                sub_prefix: parse_prefix(rest[0])?,
                super_prefix: parse_prefix(rest[1])?,
                origins: parse_asn_set(rest[2])?,
                sub_aspaths: parse_paths(rest[3])?,
                super_aspaths: parse_paths(rest[4])?,
            },
            EventType::Edges => RecordDetails::Edges {
                prefix: parse_prefix(rest[0])?,
                as1: parse_asn(rest[1])?,
                as2: parse_asn(rest[2])?,
                aspaths: parse_paths(rest[3])?,
            },
        };

        Ok(Some(PrefixEventRecord {
            view_ts,
            position,
            details,
        }))
    }

    fn payload_field_count(&self) -> usize {
        match self.event_type {
            EventType::Moas | EventType::Edges => 4,
            EventType::Submoas => 6,
            EventType::Defcon => 5,
        }
    }
}

/// Render a record back into its line form.
#[must_use]
pub fn format_record(record: &PrefixEventRecord) -> String {
    let payload = match &record.details {
        RecordDetails::Moas {
            prefix,
            origins,
            old_origins,
            aspaths,
        } => [
            prefix.clone(),
            join_asns(origins),
            join_asns(old_origins),
            join_paths(aspaths),
        ]
        .join("|"),
        RecordDetails::Submoas {
            sub_prefix,
            super_prefix,
            sub_origins,
            super_origins,
            sub_aspaths,
            super_aspaths,
        } => [
            sub_prefix.clone(),
            super_prefix.clone(),
            join_asns(sub_origins),
            join_asns(super_origins),
            join_paths(sub_aspaths),
            join_paths(super_aspaths),
        ]
        .join("|"),
        RecordDetails::Defcon {
            sub_prefix,
            super_prefix,
            origins,
            sub_aspaths,
            super_aspaths,
        } => [
            sub_prefix.clone(),
            super_prefix.clone(),
            join_asns(origins),
            join_paths(sub_aspaths),
            join_paths(super_aspaths),
        ]
        .join("|"),
        RecordDetails::Edges {
            prefix,
            as1,
            as2,
            aspaths,
        } => [
            prefix.clone(),
            as1.to_string(),
            as2.to_string(),
            join_paths(aspaths),
        ]
        .join("|"),
    };
    format!("{}|{}|{payload}", record.view_ts, record.position)
}

fn parse_prefix(raw: &str) -> Result<String, ParseError> {
    let raw = raw.trim();
    let Some((addr, len)) = raw.split_once('/') else {
        return Err(ParseError::InvalidPrefix(raw.to_string()));
    };
    let valid_len = len.parse::<u8>().is_ok_and(|l| l <= 128);
    let valid_addr = !addr.is_empty()
        && addr
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':');
    if !valid_len || !valid_addr {
        return Err(ParseError::InvalidPrefix(raw.to_string()));
    }
    Ok(raw.to_string())
}

fn parse_asn(raw: &str) -> Result<u32, ParseError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| ParseError::InvalidAsn(raw.to_string()))
}

fn parse_asn_set(raw: &str) -> Result<BTreeSet<u32>, ParseError> {
    raw.split_whitespace().map(parse_asn).collect()
}

fn parse_paths(raw: &str) -> Result<Vec<AsPath>, ParseError> {
    raw.split(':')
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.split_whitespace().map(parse_asn).collect::<Result<AsPath, _>>())
        .collect()
}

fn join_asns(asns: &BTreeSet<u32>) -> String {
    asns.iter().map(u32::to_string).collect::<Vec<_>>().join(" ")
}

fn join_paths(paths: &[AsPath]) -> String {
    paths
        .iter()
        .map(|p| p.iter().map(u32::to_string).collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join(":")
}
