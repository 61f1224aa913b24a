//! Search-index abstraction.
//!
//! The pipeline only needs four capabilities from the event store: keyed
//! lookup, idempotent upsert, delete, and an ordered, paged query. Paging is
//! exposed as a scroll whose cursor expires if it is not advanced within its
//! timeout, so producers that stall behind a full queue fail loudly instead
//! of silently re-reading stale pages.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::event::Event;
use crate::record::{EventId, EventType};

/// Default documents per page.
pub const DEFAULT_QUERY_SIZE: usize = 1000;

/// Default scroll lifetime between pages.
pub const DEFAULT_SCROLL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Filter over stored events of one type. Time bounds are unix seconds and
/// the `view_ts` range is inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub event_type: EventType,
    pub start_ts: u64,
    pub end_ts: u64,
    pub inserted_before: Option<u64>,
    pub inserted_after: Option<u64>,
    pub modified_before: Option<u64>,
    pub modified_after: Option<u64>,
    /// Only events without a primary inference.
    pub missing_inference: bool,
    /// Match events carrying any of these tags.
    pub must_tags: Vec<String>,
    /// Exclude events carrying any of these tags.
    pub must_not_tags: Vec<String>,
    pub finished: Option<bool>,
}

impl EventQuery {
    #[must_use]
    pub fn range(event_type: EventType, start_ts: u64, end_ts: u64) -> Self {
        Self {
            event_type,
            start_ts,
            end_ts,
            inserted_before: None,
            inserted_after: None,
            modified_before: None,
            modified_after: None,
            missing_inference: false,
            must_tags: Vec::new(),
            must_not_tags: Vec::new(),
            finished: None,
        }
    }

    #[must_use]
    pub fn unfinished(mut self) -> Self {
        self.finished = Some(false);
        self
    }

    /// Evaluate the filter against one event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        let tags = &event.summary.tags;
        event.event_type() == self.event_type
            && (self.start_ts..=self.end_ts).contains(&event.view_ts())
            && self.inserted_before.is_none_or(|t| event.insert_ts() < t)
            && self.inserted_after.is_none_or(|t| event.insert_ts() > t)
            && self.modified_before.is_none_or(|t| event.last_modified_ts() < t)
            && self.modified_after.is_none_or(|t| event.last_modified_ts() > t)
            && (!self.missing_inference || !event.summary.has_inference())
            && (self.must_tags.is_empty() || self.must_tags.iter().any(|t| tags.contains(t)))
            && !self.must_not_tags.iter().any(|t| tags.contains(t))
            && self.finished.is_none_or(|f| event.is_finished() == f)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One connection to the event store.
pub trait EventIndex: Send {
    /// Fetch one event by id.
    fn get(&self, id: EventId) -> Result<Option<Event>, TransportError>;

    /// Insert or replace the event stored under its id.
    ///
    /// Rejects documents above the backend size limit with
    /// [`TransportError::Oversize`].
    fn upsert(&self, event: &Event) -> Result<(), TransportError>;

    /// Remove an event. Returns whether it existed.
    fn delete(&self, id: EventId) -> Result<bool, TransportError>;

    /// Up to `limit` matching events with `view_ts > after`, ascending by
    /// `view_ts`.
    fn search(
        &self,
        query: &EventQuery,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Event>, TransportError>;
}

/// Opens independent connections, one per worker.
pub trait IndexConnector: Send + Sync {
    type Index: EventIndex + 'static;

    fn connect(&self) -> Result<Self::Index, TransportError>;
}

// ---------------------------------------------------------------------------
// Scroll
// ---------------------------------------------------------------------------

/// Paged cursor over a query result.
pub struct EventScroll<'a, I: EventIndex + ?Sized> {
    index: &'a I,
    query: EventQuery,
    page_size: usize,
    timeout: Duration,
    cursor: Option<u64>,
    last_fetch: Option<Instant>,
    exhausted: bool,
}

impl<'a, I: EventIndex + ?Sized> EventScroll<'a, I> {
    pub fn new(index: &'a I, query: EventQuery, page_size: usize, timeout: Duration) -> Self {
        Self {
            index,
            query,
            page_size: page_size.max(1),
            timeout,
            cursor: None,
            last_fetch: None,
            exhausted: false,
        }
    }

    /// Fetch the next page; `None` once the result set is exhausted.
    pub fn next_page(&mut self) -> Result<Option<Vec<Event>>, TransportError> {
        if self.exhausted {
            return Ok(None);
        }
        if let Some(last) = self.last_fetch {
            let elapsed = last.elapsed();
            if elapsed > self.timeout {
                self.exhausted = true;
                return Err(TransportError::ScrollExpired {
                    elapsed_ms: elapsed.as_millis() as u64,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        }

        let page = self.index.search(&self.query, self.cursor, self.page_size)?;
        self.last_fetch = Some(Instant::now());
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.cursor = Some(last.view_ts());
                Ok(Some(page))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory index
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<EventId, Event>,
    failing: HashSet<EventId>,
    upserts: u64,
}

/// Shared in-memory event store. Clones (and connections) see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventIndex {
    state: Arc<Mutex<MemoryState>>,
    max_document_bytes: Option<usize>,
}

impl MemoryEventIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject documents larger than `limit` bytes as oversize.
    #[must_use]
    pub fn with_max_document_bytes(mut self, limit: usize) -> Self {
        self.max_document_bytes = Some(limit);
        self
    }

    /// Make every write for `id` fail with a backend error.
    pub fn fail_writes_for(&self, id: EventId) {
        self.lock().failing.insert(id);
    }

    /// Snapshot of the stored events, ordered by id.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful upserts so far.
    #[must_use]
    pub fn upsert_count(&self) -> u64 {
        self.lock().upserts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl EventIndex for MemoryEventIndex {
    fn get(&self, id: EventId) -> Result<Option<Event>, TransportError> {
        Ok(self.lock().events.get(&id).cloned())
    }

    fn upsert(&self, event: &Event) -> Result<(), TransportError> {
        let id = event.event_id();
        if let Some(limit) = self.max_document_bytes {
            let size = event
                .document_size()
                .map_err(|e| TransportError::Backend(e.to_string()))?;
            if size > limit {
                return Err(TransportError::Oversize {
                    event_id: id.to_string(),
                    size,
                    limit,
                });
            }
        }
        let mut state = self.lock();
        if state.failing.contains(&id) {
            return Err(TransportError::Backend(format!("injected write failure for {id}")));
        }
        state.events.insert(id, event.clone());
        state.upserts += 1;
        Ok(())
    }

    fn delete(&self, id: EventId) -> Result<bool, TransportError> {
        Ok(self.lock().events.remove(&id).is_some())
    }

    fn search(
        &self,
        query: &EventQuery,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Event>, TransportError> {
        let state = self.lock();
        Ok(state
            .events
            .range(EventId::new(query.event_type, 0)..=EventId::new(query.event_type, u64::MAX))
            .map(|(_, e)| e)
            .filter(|e| after.is_none_or(|a| e.view_ts() > a))
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }
}

impl IndexConnector for MemoryEventIndex {
    type Index = Self;

    fn connect(&self) -> Result<Self::Index, TransportError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Inference, InferenceResult, TAG_RECURRING};
    use crate::record::{Position, PrefixEventRecord, RecordDetails};

    fn event(view_ts: u64, finished: bool) -> Event {
        let record = |position| PrefixEventRecord {
            view_ts,
            position,
            details: RecordDetails::Edges {
                prefix: "192.0.2.0/24".to_string(),
                as1: 64500,
                as2: 64501,
                aspaths: vec![vec![64501, 64500]],
            },
        };
        let mut event = Event::from_record(record(Position::New));
        if finished {
            event.push_record(record(Position::Finished)).unwrap();
        }
        event
    }

    fn seeded(count: u64) -> MemoryEventIndex {
        let index = MemoryEventIndex::new();
        for ts in 1..=count {
            index.upsert(&event(ts * 10, ts % 2 == 0)).unwrap();
        }
        index
    }

    #[test]
    fn upsert_is_idempotent() {
        let index = MemoryEventIndex::new();
        let e = event(10, false);
        index.upsert(&e).unwrap();
        index.upsert(&e).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(e.event_id()).unwrap().unwrap(), e);
        assert!(index.delete(e.event_id()).unwrap());
        assert!(!index.delete(e.event_id()).unwrap());
    }

    #[test]
    fn scroll_pages_in_view_ts_order() {
        let index = seeded(7);
        let query = EventQuery::range(EventType::Edges, 0, u64::MAX);
        let mut scroll = EventScroll::new(&index, query, 3, DEFAULT_SCROLL_TIMEOUT);
        let mut seen = Vec::new();
        while let Some(page) = scroll.next_page().unwrap() {
            assert!(page.len() <= 3);
            seen.extend(page.iter().map(Event::view_ts));
        }
        assert_eq!(seen, vec![10, 20, 30, 40, 50, 60, 70]);
        assert!(scroll.next_page().unwrap().is_none());
    }

    #[test]
    fn scroll_expires_when_not_advanced() {
        let index = seeded(4);
        let query = EventQuery::range(EventType::Edges, 0, u64::MAX);
        let mut scroll = EventScroll::new(&index, query, 2, Duration::from_millis(5));
        assert!(scroll.next_page().unwrap().is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(
            scroll.next_page(),
            Err(TransportError::ScrollExpired { .. })
        ));
    }

    #[test]
    fn query_filters() {
        let index = seeded(6);
        let mut tagged = event(20, true);
        tagged.summary.add_tag(TAG_RECURRING);
        tagged.summary.inference_result = Some(InferenceResult {
            primary_inference: Some(Inference {
                inference_id: "x".to_string(),
                suspicion_level: 1,
                confidence: 1,
            }),
            inferences: Vec::new(),
        });
        index.upsert(&tagged).unwrap();

        let base = EventQuery::range(EventType::Edges, 20, 50);
        let ids = |q: &EventQuery| -> Vec<u64> {
            index
                .search(q, None, 100)
                .unwrap()
                .iter()
                .map(Event::view_ts)
                .collect()
        };
        assert_eq!(ids(&base), vec![20, 30, 40, 50]);
        assert_eq!(ids(&base.clone().unfinished()), vec![30, 50]);

        let mut must = base.clone();
        must.must_tags = vec![TAG_RECURRING.to_string()];
        assert_eq!(ids(&must), vec![20]);

        let mut must_not = base.clone();
        must_not.must_not_tags = vec![TAG_RECURRING.to_string()];
        assert_eq!(ids(&must_not), vec![30, 40, 50]);

        let mut missing = base.clone();
        missing.missing_inference = true;
        assert_eq!(ids(&missing), vec![30, 40, 50]);

        let mut other_type = base;
        other_type.event_type = EventType::Moas;
        assert!(ids(&other_type).is_empty());
    }

    #[test]
    fn oversize_and_injected_failures() {
        let index = MemoryEventIndex::new().with_max_document_bytes(64);
        let e = event(10, false);
        assert!(matches!(
            index.upsert(&e),
            Err(TransportError::Oversize { limit: 64, .. })
        ));

        let index = MemoryEventIndex::new();
        index.fail_writes_for(e.event_id());
        assert!(matches!(index.upsert(&e), Err(TransportError::Backend(_))));
        assert!(index.is_empty());
    }
}
