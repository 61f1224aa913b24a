//! Property-based tests for event assembly, the open-event horizon, range
//! slicing and duration parsing.

use std::collections::BTreeSet;
use std::time::Duration;

use hijack_backfill_core::assembler::EventAssembler;
use hijack_backfill_core::backfill::split_range;
use hijack_backfill_core::config::parse_duration;
use hijack_backfill_core::event::Event;
use hijack_backfill_core::index::MemoryEventIndex;
use hijack_backfill_core::parser::PrefixRecordParser;
use hijack_backfill_core::record::{EventType, Position};
use hijack_backfill_core::tracker::UnfinishedEventTracker;
use proptest::prelude::*;

// =========================================================================
// Strategies
// =========================================================================

fn arb_position() -> impl Strategy<Value = Position> {
    prop_oneof![
        3 => Just(Position::New),
        3 => Just(Position::Ongoing),
        1 => Just(Position::Finished),
    ]
}

fn moas_line(view_ts: u64, position: Position, i: usize) -> String {
    format!("{view_ts}|{position}|10.{i}.0.0/16|64500|64500|1 64500")
}

// =========================================================================
// Assembler
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The event closes at the first FINISHED record and everything after it
    /// for the same key is rejected.
    #[test]
    fn prop_assembler_closes_at_first_finished(
        positions in prop::collection::vec(arb_position(), 1..40),
    ) {
        let lines: Vec<String> = positions
            .iter()
            .enumerate()
            .map(|(i, p)| moas_line(500, *p, i))
            .collect();
        let out = EventAssembler::new(EventType::Moas).assemble(&lines).unwrap();
        prop_assert_eq!(out.records_parsed, positions.len());

        match positions.iter().position(|p| p.is_finished()) {
            Some(idx) => {
                let event = out.finished.unwrap();
                prop_assert!(event.is_finished());
                prop_assert_eq!(event.records().len(), idx + 1);
                prop_assert_eq!(out.rejected, positions.len() - idx - 1);
                prop_assert!(out.open.is_empty());
            }
            None => {
                prop_assert!(out.finished.is_none());
                prop_assert_eq!(out.open.len(), 1);
                prop_assert_eq!(out.open[0].records().len(), positions.len());
                prop_assert_eq!(out.rejected, 0);
            }
        }
    }

    /// Records keep their file order inside an event.
    #[test]
    fn prop_assembler_preserves_order(count in 1usize..30) {
        let lines: Vec<String> = (0..count)
            .map(|i| moas_line(800, Position::Ongoing, i))
            .collect();
        let out = EventAssembler::new(EventType::Moas).assemble(&lines).unwrap();
        let prefixes: Vec<String> = out.open[0]
            .records()
            .iter()
            .map(|r| r.details.prefixes()[0].to_string())
            .collect();
        let expected: Vec<String> = (0..count).map(|i| format!("10.{i}.0.0/16")).collect();
        prop_assert_eq!(prefixes, expected);
    }
}

// =========================================================================
// Horizon
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The horizon spans the oldest open event to the newest plus the slack.
    #[test]
    fn prop_horizon_tracks_open_set(
        stamps in prop::collection::btree_set(1u64..1_000_000, 1..20),
        slack in 0u64..10_000,
    ) {
        let index = MemoryEventIndex::new();
        let parser = PrefixRecordParser::new(EventType::Moas);
        let mut tracker = UnfinishedEventTracker::new(slack);
        for ts in &stamps {
            let record = parser.parse(&moas_line(*ts, Position::New, 0)).unwrap().unwrap();
            tracker.track_open(&index, Event::from_record(record)).unwrap();
        }
        let horizon = tracker.horizon().unwrap();
        let min = *stamps.iter().next().unwrap();
        let max = *stamps.iter().next_back().unwrap();
        prop_assert_eq!(horizon.minimum_ts, min);
        prop_assert_eq!(horizon.maximum_ts, max + slack);
        prop_assert_eq!(tracker.len(), stamps.len());
        prop_assert_eq!(index.len(), stamps.len());
    }

    /// Finishing events one by one shrinks the open set and finishing all
    /// of them clears the horizon.
    #[test]
    fn prop_finishing_everything_clears_horizon(
        stamps in prop::collection::btree_set(1u64..1_000_000, 1..12),
    ) {
        let index = MemoryEventIndex::new();
        let parser = PrefixRecordParser::new(EventType::Moas);
        let mut tracker = UnfinishedEventTracker::default();
        for ts in &stamps {
            let record = parser.parse(&moas_line(*ts, Position::New, 0)).unwrap().unwrap();
            tracker.track_open(&index, Event::from_record(record)).unwrap();
        }
        for (done, ts) in stamps.iter().enumerate() {
            let record = parser.parse(&moas_line(*ts, Position::Finished, 0)).unwrap().unwrap();
            let changed = tracker.process_finished_event(&index, Event::from_record(record)).unwrap();
            // Finishing in ascending order always moves the minimum.
            prop_assert!(changed);
            prop_assert_eq!(tracker.len(), stamps.len() - done - 1);
        }
        prop_assert!(tracker.horizon().is_none());
        let finished: BTreeSet<u64> = index
            .events()
            .iter()
            .filter(|e| e.is_finished())
            .map(Event::view_ts)
            .collect();
        prop_assert_eq!(finished, stamps);
    }
}

// =========================================================================
// Range slicing
// =========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Slices are non-empty, contiguous and cover `[start, end)` exactly.
    #[test]
    fn prop_split_range_covers(
        start in 0u64..1_000_000,
        len in 1u64..100_000,
        parts in 1usize..64,
    ) {
        let end = start + len;
        let slices = split_range(start, end, parts);
        prop_assert_eq!(slices.first().unwrap().0, start);
        prop_assert_eq!(slices.last().unwrap().1, end);
        for pair in slices.windows(2) {
            prop_assert_eq!(pair[0].1, pair[1].0);
        }
        prop_assert!(slices.iter().all(|(a, b)| a < b));
        prop_assert!(slices.len() < 2 * parts);
    }

    /// Minute suffixes scale by sixty.
    #[test]
    fn prop_parse_duration_minutes(n in 0u64..100_000) {
        prop_assert_eq!(parse_duration(&format!("{n}m")).unwrap(), Duration::from_secs(n * 60));
    }
}

#[test]
fn empty_range_has_no_slices() {
    assert!(split_range(10, 10, 4).is_empty());
}
