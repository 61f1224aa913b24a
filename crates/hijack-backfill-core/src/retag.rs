//! Parallel retagging of stored events.
//!
//! The calling thread is the producer: it pages through a query and feeds a
//! bounded [`JoinableQueue`] of capacity `2 * query_size`. A fixed pool of
//! worker threads, each with its own index connection, tagger and inference
//! engine, takes one event at a time, re-validates it, re-tags it, re-infers
//! it and writes it back by id.
//!
//! Termination: once the query is exhausted (or fails) exactly one
//! [`WorkItem::Shutdown`] per worker is enqueued. Every item is acknowledged
//! on every path, panics included. A worker thread that dies anyway leaves
//! its items unacknowledged; the producer stops waiting once no worker is
//! left alive and reports the dead thread.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, SendTimeoutError, Sender, bounded};
use serde::Serialize;

use crate::classify::{ClassifierFactory, InferenceEngine, Tagger, TaggerOptions};
use crate::error::{ConfigError, Error, PipelineError, Result};
use crate::event::{Event, TAG_RECURRING, format_ts};
use crate::index::{DEFAULT_QUERY_SIZE, DEFAULT_SCROLL_TIMEOUT, EventIndex, EventQuery, EventScroll, IndexConnector};

// ---------------------------------------------------------------------------
// Joinable queue
// ---------------------------------------------------------------------------

/// How often blocked `put_while`/`join_while` calls re-check liveness.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.count
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Bounded MPMC queue that counts unacknowledged items.
///
/// `put` blocks while the queue is full and `get` while it is empty. Every
/// item handed out by `get` comes with a [`TaskDone`] guard; the item counts
/// as acknowledged when the guard drops. [`JoinableQueue::join`] blocks until
/// every item ever put has been acknowledged.
#[derive(Debug)]
pub struct JoinableQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    pending: Arc<Pending>,
}

impl<T> Clone for JoinableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

/// Acknowledgement guard for one dequeued item.
#[derive(Debug)]
#[must_use = "dropping the guard acknowledges the item"]
pub struct TaskDone {
    pending: Arc<Pending>,
}

impl TaskDone {
    /// Acknowledge explicitly.
    pub fn ack(self) {}
}

impl Drop for TaskDone {
    fn drop(&mut self) {
        let mut count = self.pending.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.pending.drained.notify_all();
        }
    }
}

impl<T> JoinableQueue<T> {
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            pending: Arc::new(Pending::default()),
        }
    }

    /// Enqueue, blocking while full.
    pub fn put(&self, item: T) -> std::result::Result<(), PipelineError> {
        *self.pending.lock() += 1;
        if self.tx.send(item).is_err() {
            self.release();
            return Err(PipelineError::QueueClosed);
        }
        Ok(())
    }

    /// Enqueue, blocking while full and `live()` holds.
    ///
    /// Fails with [`PipelineError::QueueClosed`] once the queue is still full
    /// and `live()` returns false. The item is dropped and never counted.
    pub fn put_while(
        &self,
        mut item: T,
        live: impl Fn() -> bool,
    ) -> std::result::Result<(), PipelineError> {
        *self.pending.lock() += 1;
        loop {
            match self.tx.send_timeout(item, LIVENESS_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) if live() => item = back,
                Err(_) => {
                    self.release();
                    return Err(PipelineError::QueueClosed);
                }
            }
        }
    }

    fn release(&self) {
        drop(TaskDone {
            pending: Arc::clone(&self.pending),
        });
    }

    /// Dequeue, blocking while empty.
    pub fn get(&self) -> std::result::Result<(T, TaskDone), PipelineError> {
        let item = self.rx.recv().map_err(|_| PipelineError::QueueClosed)?;
        Ok((
            item,
            TaskDone {
                pending: Arc::clone(&self.pending),
            },
        ))
    }

    /// Block until every item put so far has been acknowledged.
    pub fn join(&self) {
        let mut count = self.pending.lock();
        while *count > 0 {
            count = self
                .pending
                .drained
                .wait(count)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Block until every item has been acknowledged or `live()` turns false.
    ///
    /// Returns whether the queue drained.
    pub fn join_while(&self, live: impl Fn() -> bool) -> bool {
        let mut count = self.pending.lock();
        while *count > 0 {
            if !live() {
                return false;
            }
            let (next, _) = self
                .pending
                .drained
                .wait_timeout(count, LIVENESS_POLL)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            count = next;
        }
        true
    }

    /// Items put but not yet acknowledged.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Items waiting in the channel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Work items and reports
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum WorkItem {
    Event(Box<Event>),
    Shutdown,
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetagOutcome {
    Retagged,
    SkippedRecurring,
    DeletedInconsistent,
}

#[derive(Debug, Default)]
struct RetagCounters {
    retagged: AtomicUsize,
    skipped_recurring: AtomicUsize,
    deleted_inconsistent: AtomicUsize,
    oversize_skipped: AtomicUsize,
    failed: AtomicUsize,
}

impl RetagCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetagReport {
    pub enqueued: usize,
    pub retagged: usize,
    pub skipped_recurring: usize,
    pub deleted_inconsistent: usize,
    pub oversize_skipped: usize,
    pub failed: usize,
}

impl RetagReport {
    /// Items acknowledged by workers, excluding shutdown sentinels.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.retagged
            + self.skipped_recurring
            + self.deleted_inconsistent
            + self.oversize_skipped
            + self.failed
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetagConfig {
    pub query: EventQuery,
    pub processes: usize,
    pub query_size: usize,
    pub scroll_timeout: Duration,
    /// Skip tagging and only re-run inference.
    pub reinference: bool,
    pub options: TaggerOptions,
}

impl RetagConfig {
    #[must_use]
    pub fn new(query: EventQuery) -> Self {
        Self {
            query,
            processes: 1,
            query_size: DEFAULT_QUERY_SIZE,
            scroll_timeout: DEFAULT_SCROLL_TIMEOUT,
            reinference: false,
            options: TaggerOptions {
                in_memory_data: true,
                force_process_view: true,
                ..TaggerOptions::default()
            },
        }
    }

    /// Events missing an inference only need the inference step.
    #[must_use]
    pub fn inference_only(&self) -> bool {
        self.reinference || self.query.missing_inference
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.processes == 0 {
            return Err(ConfigError::Invalid("retag needs at least one worker".to_string()));
        }
        if self.query_size == 0 {
            return Err(ConfigError::Invalid("query size must be > 0".to_string()));
        }
        self.options.validate()
    }
}

struct WorkerResources<I> {
    index: I,
    tagger: Box<dyn Tagger>,
    engine: Box<dyn InferenceEngine>,
}

pub struct RetagPipeline<C, F> {
    connector: Arc<C>,
    factory: Arc<F>,
    config: Arc<RetagConfig>,
}

impl<C, F> RetagPipeline<C, F>
where
    C: IndexConnector + 'static,
    F: ClassifierFactory + 'static,
{
    pub fn new(connector: Arc<C>, factory: Arc<F>, config: RetagConfig) -> Self {
        Self {
            connector,
            factory,
            config: Arc::new(config),
        }
    }

    /// Retag every event matching the query.
    ///
    /// A producer failure (e.g. an expired scroll) is returned only after the
    /// workers have drained the queue and exited.
    pub fn run(&self) -> Result<RetagReport> {
        self.config.validate()?;
        let workers = self.config.processes;

        // Open every connection before any work is queued so a failure here
        // cannot strand a sentinel.
        let mut resources = Vec::with_capacity(workers);
        for _ in 0..workers {
            resources.push(WorkerResources {
                index: self.connector.connect()?,
                tagger: self.factory.tagger(&self.config.options)?,
                engine: self.factory.inference_engine()?,
            });
        }
        let producer_index = self.connector.connect()?;

        let queue = JoinableQueue::bounded(self.config.query_size.saturating_mul(2));
        let counters = Arc::new(RetagCounters::default());

        let mut handles = Vec::with_capacity(workers);
        for (worker, res) in resources.into_iter().enumerate() {
            let worker_queue = queue.clone();
            let config = Arc::clone(&self.config);
            let counters = Arc::clone(&counters);
            let spawned = std::thread::Builder::new()
                .name(format!("retag-worker-{worker}"))
                .spawn(move || worker_loop(worker, &worker_queue, res, &config, &counters));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for _ in 0..handles.len() {
                        queue.put(WorkItem::Shutdown)?;
                    }
                    queue.join();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(PipelineError::Spawn(err).into());
                }
            }
        }

        let live = || handles.iter().any(|h| !h.is_finished());
        let mut enqueued = 0;
        let produced = self.produce(&producer_index, &queue, &live, &mut enqueued);

        let mut drained = true;
        for _ in 0..workers {
            if queue.put_while(WorkItem::Shutdown, &live).is_err() {
                drained = false;
                break;
            }
        }
        drained &= queue.join_while(&live);
        if !drained {
            tracing::error!(
                pending = queue.pending(),
                "every retag worker exited with work still queued"
            );
        }

        let mut dead = None;
        for handle in handles {
            let name = handle.thread().name().unwrap_or("retag-worker").to_string();
            if handle.join().is_err() && dead.is_none() {
                dead = Some(name);
            }
        }
        if let Some(name) = dead {
            return Err(PipelineError::WorkerPanicked(name).into());
        }
        if !drained {
            return Err(PipelineError::WorkerPanicked("retag-worker".to_string()).into());
        }

        let report = RetagReport {
            enqueued,
            retagged: counters.retagged.load(Ordering::Relaxed),
            skipped_recurring: counters.skipped_recurring.load(Ordering::Relaxed),
            deleted_inconsistent: counters.deleted_inconsistent.load(Ordering::Relaxed),
            oversize_skipped: counters.oversize_skipped.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        };
        tracing::info!(
            enqueued = report.enqueued,
            retagged = report.retagged,
            skipped_recurring = report.skipped_recurring,
            deleted_inconsistent = report.deleted_inconsistent,
            oversize_skipped = report.oversize_skipped,
            failed = report.failed,
            "retag complete"
        );

        produced.map(|()| report)
    }

    fn produce(
        &self,
        index: &C::Index,
        queue: &JoinableQueue<WorkItem>,
        live: &dyn Fn() -> bool,
        enqueued: &mut usize,
    ) -> Result<()> {
        let mut scroll = EventScroll::new(
            index,
            self.config.query.clone(),
            self.config.query_size,
            self.config.scroll_timeout,
        );
        while let Some(page) = scroll.next_page().inspect_err(|err| {
            tracing::error!(error = %err, enqueued = *enqueued, "retag query failed");
        })? {
            let last_ts = page.last().map(Event::view_ts);
            for event in page {
                queue.put_while(WorkItem::Event(Box::new(event)), live)?;
                *enqueued += 1;
            }
            if let Some(ts) = last_ts {
                tracing::info!(enqueued = *enqueued, view_ts = ts, time = %format_ts(ts), "queued page");
            }
        }
        Ok(())
    }
}

fn worker_loop<I: EventIndex>(
    worker: usize,
    queue: &JoinableQueue<WorkItem>,
    mut res: WorkerResources<I>,
    config: &RetagConfig,
    counters: &RetagCounters,
) {
    loop {
        let (item, done) = match queue.get() {
            Ok(next) => next,
            Err(err) => {
                tracing::error!(worker, error = %err, "work queue closed");
                return;
            }
        };
        let event = match item {
            WorkItem::Shutdown => {
                tracing::debug!(worker, "worker exiting");
                done.ack();
                return;
            }
            WorkItem::Event(event) => *event,
        };

        let id = event.event_id();
        tracing::debug!(worker, event_id = %id, "retagging");
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| retag_event(&mut res, config, event)));
        match outcome {
            Ok(Ok(RetagOutcome::Retagged)) => RetagCounters::bump(&counters.retagged),
            Ok(Ok(RetagOutcome::SkippedRecurring)) => {
                RetagCounters::bump(&counters.skipped_recurring);
            }
            Ok(Ok(RetagOutcome::DeletedInconsistent)) => {
                RetagCounters::bump(&counters.deleted_inconsistent);
            }
            Ok(Err(err)) if err.is_oversize() => {
                tracing::warn!(worker, event_id = %id, error = %err, "event too large, skipped");
                RetagCounters::bump(&counters.oversize_skipped);
            }
            Ok(Err(err)) => {
                tracing::error!(worker, event_id = %id, error = %err, "retag failed");
                RetagCounters::bump(&counters.failed);
            }
            Err(panic) => {
                tracing::error!(worker, event_id = %id, panic = %panic_message(&*panic), "retag panicked");
                RetagCounters::bump(&counters.failed);
            }
        }
        done.ack();
    }
}

/// Validate, tag, infer and write back one event.
fn retag_event<I: EventIndex>(
    res: &mut WorkerResources<I>,
    config: &RetagConfig,
    mut event: Event,
) -> Result<RetagOutcome> {
    let id = event.event_id();
    if let Err(err) = event.check_integrity() {
        tracing::warn!(event_id = %id, error = %err, "inconsistent event deleted");
        res.index.delete(id)?;
        return Ok(RetagOutcome::DeletedInconsistent);
    }
    if event.summary.has_tag(TAG_RECURRING) {
        tracing::debug!(event_id = %id, "recurring event skipped");
        return Ok(RetagOutcome::SkippedRecurring);
    }

    event.summary.clear_inference();
    if !config.inference_only() {
        let ts = event.view_ts();
        res.tagger.update_datasets(ts)?;
        res.tagger.prepare_for_view(ts)?;
        res.tagger.tag_event(&mut event)?;
    }
    res.engine.infer(&mut event)?;
    event.touch();
    res.index.upsert(&event).map_err(Error::from)?;
    Ok(RetagOutcome::Retagged)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn join_waits_for_every_ack() {
        let queue = JoinableQueue::bounded(4);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let (item, done): (Option<u32>, TaskDone) = queue.get().unwrap();
                    match item {
                        Some(v) => seen.push(v),
                        None => {
                            done.ack();
                            return seen;
                        }
                    }
                    done.ack();
                }
            })
        };
        for v in 0..10 {
            queue.put(Some(v)).unwrap();
        }
        queue.put(None).unwrap();
        queue.join();
        assert_eq!(queue.pending(), 0);
        assert_eq!(consumer.join().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn dropped_guard_acknowledges() {
        let queue = JoinableQueue::bounded(1);
        queue.put(1u8).unwrap();
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.len(), 1);
        let (_, done) = queue.get().unwrap();
        drop(done);
        assert_eq!(queue.pending(), 0);
        queue.join();
    }

    #[test]
    fn guard_acknowledges_during_unwind() {
        let queue = JoinableQueue::bounded(1);
        queue.put(1u8).unwrap();
        let worker = {
            let queue = queue.clone();
            thread::spawn(move || {
                let (_item, _done) = queue.get().unwrap();
                panic!("boom");
            })
        };
        assert!(worker.join().is_err());
        queue.join();
        assert!(queue.is_empty());
    }

    #[test]
    fn join_while_stops_waiting_once_consumers_are_gone() {
        let queue = JoinableQueue::bounded(4);
        let consumer = thread::spawn(|| {});
        while !consumer.is_finished() {
            thread::yield_now();
        }
        queue.put(1u8).unwrap();
        assert!(!queue.join_while(|| !consumer.is_finished()));
        assert_eq!(queue.pending(), 1);

        let (_, done) = queue.get().unwrap();
        done.ack();
        assert!(queue.join_while(|| false));
    }

    #[test]
    fn put_while_fails_on_full_queue_without_consumers() {
        let queue = JoinableQueue::bounded(1);
        queue.put(1u8).unwrap();
        assert!(matches!(
            queue.put_while(2u8, || false),
            Err(PipelineError::QueueClosed)
        ));
        assert_eq!(queue.pending(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn config_rules() {
        let query = EventQuery::range(crate::record::EventType::Moas, 0, 10);
        let mut config = RetagConfig::new(query);
        assert!(config.validate().is_ok());
        assert!(!config.inference_only());
        config.query.missing_inference = true;
        assert!(config.inference_only());
        config.processes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
    }
}
