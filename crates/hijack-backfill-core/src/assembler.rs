//! Groups the records of one source file into events.
//!
//! A source file is one capture window: the records of every event that was
//! active at that time, in arrival order. The assembler seeds an event from
//! the first record of each key, appends the rest, and closes a key as soon
//! as a `FINISHED` record arrives. Records for a closed key are rejected.

use std::collections::{BTreeMap, HashSet};

use crate::error::{EventError, ParseError};
use crate::event::Event;
use crate::parser::{PrefixRecordParser, format_record};
use crate::record::{EventId, EventType};

/// Everything one file contributed.
#[derive(Debug, Default)]
pub struct AssembledFile {
    /// First event to reach FINISHED in this file.
    pub finished: Option<Event>,
    /// Other events that also finished in this file, in finishing order.
    pub also_finished: Vec<Event>,
    /// Events still open at the end of the file, ordered by key.
    pub open: Vec<Event>,
    /// Physical lines read, comments included.
    pub lines_read: usize,
    /// Data lines parsed into records.
    pub records_parsed: usize,
    /// Records refused because their event had already finished.
    pub rejected: usize,
}

impl AssembledFile {
    /// Every finished event, first one first.
    pub fn finished_events(self) -> impl Iterator<Item = Event> {
        self.finished.into_iter().chain(self.also_finished)
    }
}

/// Assembler bound to one event type and (for logging) one file name.
#[derive(Debug, Clone)]
pub struct EventAssembler {
    parser: PrefixRecordParser,
    file: String,
}

impl EventAssembler {
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            parser: PrefixRecordParser::new(event_type),
            file: String::from("<memory>"),
        }
    }

    /// Name used in log lines.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    /// The event that reached FINISHED in these lines, if any.
    ///
    /// `None` means no record reached FINISHED; the file must not count as
    /// consumed for completion purposes.
    pub fn finished_event<I, S>(&self, lines: I) -> Result<Option<Event>, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(self.assemble(lines)?.finished)
    }

    /// Assemble every event in these lines.
    ///
    /// The first schema violation aborts the whole file with the offending
    /// line number attached.
    pub fn assemble<I, S>(&self, lines: I) -> Result<AssembledFile, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = AssembledFile::default();
        let mut open: BTreeMap<EventId, Event> = BTreeMap::new();
        let mut closed: HashSet<EventId> = HashSet::new();
        let mut finished: Vec<Event> = Vec::new();

        for (idx, line) in lines.into_iter().enumerate() {
            out.lines_read += 1;
            let Some(record) = self
                .parser
                .parse(line.as_ref())
                .map_err(|e| e.at_line(idx + 1))?
            else {
                continue;
            };
            out.records_parsed += 1;

            let key = record.event_key();
            if closed.contains(&key) {
                out.rejected += 1;
                tracing::warn!(
                    file = %self.file,
                    event_id = %key,
                    record = %format_record(&record),
                    "record after FINISHED rejected"
                );
                continue;
            }

            let Some(event) = open.get_mut(&key) else {
                let event = Event::from_record(record);
                if event.is_finished() {
                    closed.insert(key);
                    finished.push(event);
                } else {
                    open.insert(key, event);
                }
                continue;
            };

            match event.push_record(record) {
                Ok(()) => {}
                Err(EventError::DuplicateRecord { fingerprint, .. }) => {
                    tracing::debug!(file = %self.file, event_id = %key, %fingerprint, "duplicate record skipped");
                }
                Err(err) => {
                    out.rejected += 1;
                    tracing::warn!(file = %self.file, event_id = %key, error = %err, "record rejected");
                }
            }
            if event.is_finished() {
                closed.insert(key);
                if let Some(done) = open.remove(&key) {
                    finished.push(done);
                }
            }
        }

        let mut finished = finished.into_iter();
        out.finished = finished.next();
        out.also_finished = finished.collect();
        if let Some(first) = &out.finished {
            for other in &out.also_finished {
                tracing::warn!(
                    file = %self.file,
                    event_id = %other.event_id(),
                    first = %first.event_id(),
                    "more than one event finished in file"
                );
            }
        }
        out.open = open.into_values().collect();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Position;

    const FILE: &str = "\
# moas events for 1546300800
1546300800|NEW|192.0.2.0/24|64500 64501|64500|1 64500:2 64501
1546300800|ONGOING|198.51.100.0/24|64500 64502|64500|1 64500:3 64502

1546297200|ONGOING|203.0.113.0/24|64510 64511|64510|4 64510:5 64511
1546300800|FINISHED|192.0.2.0/24|64500 64501|64500|1 64500:2 64501
1546300800|ONGOING|192.0.2.0/24|64500 64501|64500|1 64500:2 64501
";

    #[test]
    fn closes_event_on_finished_and_rejects_late_records() {
        let out = EventAssembler::new(EventType::Moas)
            .with_file("moas.1546300800.events.gz")
            .assemble(FILE.lines())
            .unwrap();

        assert_eq!(out.lines_read, 7);
        assert_eq!(out.records_parsed, 5);
        assert_eq!(out.rejected, 1);

        let finished = out.finished.unwrap();
        assert_eq!(finished.event_id().to_string(), "moas-1546300800");
        let positions: Vec<Position> = finished.records().iter().map(|r| r.position).collect();
        assert_eq!(
            positions,
            vec![Position::New, Position::Ongoing, Position::Finished]
        );

        assert_eq!(out.open.len(), 1);
        assert_eq!(out.open[0].event_id().to_string(), "moas-1546297200");
        assert!(out.also_finished.is_empty());
    }

    #[test]
    fn no_finished_record_yields_none() {
        let lines = ["10|NEW|192.0.2.0/24|1||", "10|ONGOING|192.0.2.0/24|1 2||"];
        let event = EventAssembler::new(EventType::Moas)
            .finished_event(lines)
            .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn parse_error_reports_line_number() {
        let lines = ["# header", "10|NEW|192.0.2.0/24|1||", "10|NEW|bogus"];
        let err = EventAssembler::new(EventType::Moas)
            .assemble(lines)
            .unwrap_err();
        assert!(matches!(err, ParseError::AtLine { line: 3, .. }));
    }

    #[test]
    fn first_finisher_wins_and_others_are_kept_aside() {
        let lines = [
            "20|FINISHED|192.0.2.0/24|1||",
            "10|NEW|198.51.100.0/24|2||",
            "10|FINISHED|198.51.100.0/24|2||",
        ];
        let out = EventAssembler::new(EventType::Moas).assemble(lines).unwrap();
        assert_eq!(out.finished.as_ref().unwrap().view_ts(), 20);
        assert_eq!(out.also_finished.len(), 1);
        assert_eq!(out.also_finished[0].view_ts(), 10);
        assert_eq!(out.finished_events().count(), 2);
    }

    #[test]
    fn empty_file_is_not_an_error() {
        let out = EventAssembler::new(EventType::Edges)
            .assemble(Vec::<String>::new())
            .unwrap();
        assert!(out.finished.is_none());
        assert!(out.open.is_empty());
        assert_eq!(out.records_parsed, 0);
    }
}
