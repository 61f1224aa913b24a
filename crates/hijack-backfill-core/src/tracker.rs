//! Open-event bookkeeping for the file finisher.
//!
//! The tracker holds every event that has not yet received a `FINISHED`
//! record, keyed by [`EventId`]. Its smallest and largest keys bound the
//! source files that can still complete something: nothing before the oldest
//! open event matters, and nothing later than the newest open event plus a
//! slack window is scanned.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::index::{DEFAULT_QUERY_SIZE, EventIndex, EventQuery};
use crate::record::{EventId, EventType};

/// Default seconds added to the newest open key to form the scan horizon.
pub const DEFAULT_LOOKBACK_SLACK_SECS: u64 = 3600;

/// Inclusive file-timestamp bounds still worth scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    pub minimum_ts: u64,
    pub maximum_ts: u64,
}

impl Horizon {
    #[must_use]
    pub fn contains(&self, ts: u64) -> bool {
        (self.minimum_ts..=self.maximum_ts).contains(&ts)
    }
}

/// What folding one finished event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FinishOutcome {
    /// The merged event was written to the index.
    pub written: bool,
    /// The open set's minimum moved.
    pub minimum_changed: bool,
}

#[derive(Debug)]
pub struct UnfinishedEventTracker {
    events: BTreeMap<EventId, Event>,
    lookback_slack: u64,
}

impl Default for UnfinishedEventTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK_SLACK_SECS)
    }
}

impl UnfinishedEventTracker {
    #[must_use]
    pub fn new(lookback_slack: u64) -> Self {
        Self {
            events: BTreeMap::new(),
            lookback_slack,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: EventId) -> bool {
        self.events.contains_key(&id)
    }

    /// Keys still open, ascending.
    pub fn open_ids(&self) -> impl Iterator<Item = EventId> + '_ {
        self.events.keys().copied()
    }

    /// Oldest open view timestamp.
    #[must_use]
    pub fn minimum_ts(&self) -> Option<u64> {
        self.events.keys().next().map(|id| id.view_ts)
    }

    /// `[min, max + slack]` over the open keys, `None` when nothing is open.
    #[must_use]
    pub fn horizon(&self) -> Option<Horizon> {
        let min = self.events.keys().next()?;
        let max = self.events.keys().next_back()?;
        Some(Horizon {
            minimum_ts: min.view_ts,
            maximum_ts: max.view_ts.saturating_add(self.lookback_slack),
        })
    }

    /// Load stored events with `view_ts` in `[start_ts, end_ts]` that have
    /// not finished. Returns how many were added.
    pub fn load_unfinished<I: EventIndex + ?Sized>(
        &mut self,
        index: &I,
        event_type: EventType,
        start_ts: u64,
        end_ts: u64,
    ) -> Result<usize> {
        let query = EventQuery::range(event_type, start_ts, end_ts).unfinished();
        let mut cursor = None;
        let mut loaded = 0;
        loop {
            let page = index.search(&query, cursor, DEFAULT_QUERY_SIZE)?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.view_ts());
            let full = page.len() == DEFAULT_QUERY_SIZE;
            for event in page {
                if event.is_finished() {
                    tracing::warn!(event_id = %event.event_id(), "index returned a finished event as unfinished");
                    continue;
                }
                if self.events.insert(event.event_id(), event).is_none() {
                    loaded += 1;
                }
            }
            if !full {
                break;
            }
        }
        tracing::info!(
            event_type = %event_type,
            start_ts,
            end_ts,
            loaded,
            "loaded unfinished events"
        );
        Ok(loaded)
    }

    /// Fold a finished event into the store.
    ///
    /// Returns whether the open set's minimum changed. A finished event whose
    /// stored copy is already finished is a no-op. An oversize rejection is
    /// logged and the event is dropped from the open set; other write errors
    /// propagate and leave the tracker unchanged.
    pub fn process_finished_event<I: EventIndex + ?Sized>(
        &mut self,
        index: &I,
        event: Event,
    ) -> Result<bool> {
        self.finish_event(index, event, |_| Ok(()))
            .map(|outcome| outcome.minimum_changed)
    }

    /// [`Self::process_finished_event`] with a hook that sees the fully
    /// merged event (tracked or stored records first) right before it is
    /// written. A hook error leaves the tracker unchanged.
    pub fn finish_event<I, F>(&mut self, index: &I, event: Event, prepare: F) -> Result<FinishOutcome>
    where
        I: EventIndex + ?Sized,
        F: FnOnce(&mut Event) -> Result<()>,
    {
        let id = event.event_id();
        let before = self.minimum_ts();

        let merged = if let Some(tracked) = self.events.get(&id) {
            let mut merged = tracked.clone();
            merged.absorb(event)?;
            Some(merged)
        } else {
            match index.get(id)? {
                Some(stored) if stored.is_finished() => {
                    tracing::debug!(event_id = %id, "event already finished in index");
                    None
                }
                Some(mut stored) => {
                    stored.absorb(event)?;
                    Some(stored)
                }
                None => Some(event),
            }
        };

        let mut written = false;
        if let Some(mut merged) = merged {
            prepare(&mut merged)?;
            merged.touch();
            match index.upsert(&merged) {
                Ok(()) => {
                    written = true;
                    tracing::info!(
                        event_id = %id,
                        records = merged.records().len(),
                        "finished event written"
                    );
                }
                Err(err) => {
                    let err = Error::from(err);
                    if !err.is_oversize() {
                        return Err(err);
                    }
                    tracing::warn!(event_id = %id, error = %err, "finished event skipped");
                }
            }
        }

        self.events.remove(&id);
        Ok(FinishOutcome {
            written,
            minimum_changed: self.minimum_ts() != before,
        })
    }

    /// Insert or extend an open event and persist it as partial.
    ///
    /// Returns whether the open set's minimum changed. Finished input is
    /// routed through [`Self::process_finished_event`].
    pub fn track_open<I: EventIndex + ?Sized>(&mut self, index: &I, event: Event) -> Result<bool> {
        if event.is_finished() {
            return self.process_finished_event(index, event);
        }
        let id = event.event_id();
        let before = self.minimum_ts();

        let mut merged = match self.events.get(&id) {
            Some(tracked) => tracked.clone(),
            None => match index.get(id)? {
                Some(stored) if stored.is_finished() => {
                    tracing::debug!(event_id = %id, "open records for an event already finished");
                    return Ok(false);
                }
                Some(stored) => stored,
                None => {
                    self.persist_open(index, event)?;
                    return Ok(self.minimum_ts() != before);
                }
            },
        };
        merged.absorb(event)?;
        self.persist_open(index, merged)?;
        Ok(self.minimum_ts() != before)
    }

    fn persist_open<I: EventIndex + ?Sized>(&mut self, index: &I, mut event: Event) -> Result<()> {
        let id = event.event_id();
        event.touch();
        match index.upsert(&event) {
            Ok(()) => {
                self.events.insert(id, event);
                Ok(())
            }
            Err(err) => {
                let err = Error::from(err);
                if !err.is_oversize() {
                    return Err(err);
                }
                tracing::warn!(event_id = %id, error = %err, "open event skipped");
                self.events.remove(&id);
                Ok(())
            }
        }
    }
}
