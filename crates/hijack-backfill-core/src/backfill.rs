//! File-based backfill.
//!
//! Two modes share one scan loop over the source files of a time range:
//!
//! - **Finish**: load the stored events that never finished, then scan only
//!   the files inside the tracker horizon, folding each finished event into
//!   the store. Stops as soon as nothing is left open.
//! - **Replay**: replay every file in the range, writing finished events
//!   and partial events. With a tagger, each finished event is tagged after
//!   it has been merged with its tracked, stored and cached records.
//!
//! Files in `[start - window, start)` are cache files: their open records
//! warm a per-run cache that is merged into the same keys later on, and
//! nothing else is written from them.
//!
//! A failing file (parse error, unreadable, write error) is logged, counted
//! and skipped; it never aborts the run.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::assembler::{AssembledFile, EventAssembler};
use crate::classify::{ClassifierFactory, Tagger, TaggerOptions};
use crate::config::DEFAULT_WINDOW_SECS;
use crate::error::{ConfigError, Error, PipelineError, Result};
use crate::event::{Event, format_ts, unix_now};
use crate::index::{EventIndex, IndexConnector};
use crate::record::{EventId, EventType};
use crate::source::{SourceFile, SourceStore};
use crate::tracker::{DEFAULT_LOOKBACK_SLACK_SECS, UnfinishedEventTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillMode {
    /// Complete stored partial events from source files.
    #[default]
    Finish,
    /// Replay every source file in the range.
    Replay,
}

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub mode: BackfillMode,
    pub window_secs: u64,
    pub lookback_slack_secs: u64,
    pub options: TaggerOptions,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            mode: BackfillMode::Finish,
            window_secs: DEFAULT_WINDOW_SECS,
            lookback_slack_secs: DEFAULT_LOOKBACK_SLACK_SECS,
            options: TaggerOptions::default(),
        }
    }
}

impl BackfillSettings {
    #[must_use]
    pub fn replay(options: TaggerOptions) -> Self {
        Self {
            mode: BackfillMode::Replay,
            options,
            ..Self::default()
        }
    }
}

/// A file that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub view_ts: u64,
    pub error: String,
}

/// Counters for one run (or the merge of several).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    /// Unfinished events loaded from the index.
    pub loaded: usize,
    /// In-range files assembled.
    pub files_scanned: usize,
    /// Files read only to warm the cache.
    pub cache_files: usize,
    /// Files before the horizon minimum.
    pub files_skipped: usize,
    pub files_failed: usize,
    /// Finished events written to the index.
    pub events_finished: usize,
    /// Partial events written (replay).
    pub events_partial: usize,
    /// Records refused because their event had already finished.
    pub records_rejected: usize,
    /// The open set drained before the files ran out.
    pub early_exit: bool,
    /// Keys still open when the run ended; they stay stored as partial.
    pub still_open: Vec<EventId>,
    pub failures: Vec<FileFailure>,
}

impl BackfillReport {
    /// Fold another slice's report into this one.
    pub fn merge(&mut self, other: Self) {
        self.loaded += other.loaded;
        self.files_scanned += other.files_scanned;
        self.cache_files += other.cache_files;
        self.files_skipped += other.files_skipped;
        self.files_failed += other.files_failed;
        self.events_finished += other.events_finished;
        self.events_partial += other.events_partial;
        self.records_rejected += other.records_rejected;
        self.early_exit |= other.early_exit;
        self.still_open.extend(other.still_open);
        self.still_open.sort();
        self.still_open.dedup();
        self.failures.extend(other.failures);
    }

    fn record_failure(&mut self, file: &SourceFile, err: &Error) {
        tracing::error!(
            file = %file.name,
            view_ts = file.view_ts,
            time = %format_ts(file.view_ts),
            error = %err,
            "source file failed"
        );
        self.files_failed += 1;
        self.failures.push(FileFailure {
            file: file.name.clone(),
            view_ts: file.view_ts,
            error: err.to_string(),
        });
    }
}

/// Per-run state. Built at the start of a run and dropped at its end.
#[derive(Debug)]
pub struct BackfillContext {
    pub tracker: UnfinishedEventTracker,
    warm_cache: BTreeMap<EventId, Event>,
    pub report: BackfillReport,
}

impl BackfillContext {
    #[must_use]
    pub fn new(lookback_slack: u64) -> Self {
        Self {
            tracker: UnfinishedEventTracker::new(lookback_slack),
            warm_cache: BTreeMap::new(),
            report: BackfillReport::default(),
        }
    }

    /// Stash open records seen before the requested start.
    fn warm(&mut self, event: Event) {
        let id = event.event_id();
        match self.warm_cache.get_mut(&id) {
            Some(cached) => {
                if let Err(err) = cached.absorb(event) {
                    tracing::warn!(event_id = %id, error = %err, "cache merge failed");
                }
            }
            None => {
                self.warm_cache.insert(id, event);
            }
        }
    }

    /// Prepend cached records for the same key, if any.
    fn with_warm_records(&mut self, event: Event) -> Event {
        let Some(mut cached) = self.warm_cache.remove(&event.event_id()) else {
            return event;
        };
        match cached.absorb(event) {
            Ok(taken) => {
                tracing::debug!(event_id = %cached.event_id(), taken, "merged cached records");
            }
            Err(err) => {
                tracing::warn!(event_id = %cached.event_id(), error = %err, "cache merge failed");
            }
        }
        cached
    }

    fn finish(mut self) -> BackfillReport {
        self.report.still_open = self.tracker.open_ids().collect();
        if !self.report.still_open.is_empty() {
            tracing::warn!(
                still_open = self.report.still_open.len(),
                "events remain unfinished; stored as partial, re-run the range later"
            );
        }
        self.report
    }
}

/// Runs one backfill over one time range.
pub struct BackfillDriver<'a, S: SourceStore + ?Sized, I: EventIndex + ?Sized> {
    source: &'a S,
    index: &'a I,
    settings: BackfillSettings,
    tagger: Option<Box<dyn Tagger>>,
}

impl<'a, S: SourceStore + ?Sized, I: EventIndex + ?Sized> BackfillDriver<'a, S, I> {
    pub fn new(source: &'a S, index: &'a I, settings: BackfillSettings) -> Self {
        Self {
            source,
            index,
            settings,
            tagger: None,
        }
    }

    /// Tag finished events before they are written (replay mode).
    #[must_use]
    pub fn with_tagger(mut self, tagger: Box<dyn Tagger>) -> Self {
        self.tagger = Some(tagger);
        self
    }

    /// Backfill `[start_ts, end_ts]`; `end_ts` defaults to now.
    pub fn run(
        &mut self,
        event_type: EventType,
        start_ts: u64,
        end_ts: Option<u64>,
    ) -> Result<BackfillReport> {
        self.settings.options.validate()?;
        let end_ts = end_ts.unwrap_or_else(unix_now);
        if end_ts < start_ts {
            return Err(ConfigError::Invalid(format!(
                "end {end_ts} is before start {start_ts}"
            ))
            .into());
        }

        let span = tracing::info_span!(
            "backfill",
            event_type = %event_type,
            mode = ?self.settings.mode,
            start_ts,
            end_ts
        );
        let _guard = span.enter();

        let mut ctx = BackfillContext::new(self.settings.lookback_slack_secs);
        match self.settings.mode {
            BackfillMode::Finish => self.run_finish(&mut ctx, event_type, start_ts, end_ts)?,
            BackfillMode::Replay => self.run_replay(&mut ctx, event_type, start_ts, end_ts)?,
        }
        let report = ctx.finish();
        tracing::info!(
            files_scanned = report.files_scanned,
            files_failed = report.files_failed,
            events_finished = report.events_finished,
            events_partial = report.events_partial,
            still_open = report.still_open.len(),
            "backfill complete"
        );
        Ok(report)
    }

    fn run_finish(
        &mut self,
        ctx: &mut BackfillContext,
        event_type: EventType,
        start_ts: u64,
        end_ts: u64,
    ) -> Result<()> {
        ctx.report.loaded = ctx
            .tracker
            .load_unfinished(self.index, event_type, start_ts, end_ts)?;
        let Some(mut horizon) = ctx.tracker.horizon() else {
            tracing::info!("no unfinished events in range");
            return Ok(());
        };

        let cache_start = start_ts.saturating_sub(self.settings.window_secs);
        let files = self
            .source
            .list_files(event_type, cache_start, horizon.maximum_ts)?;

        for file in files {
            if file.view_ts < start_ts {
                self.scan_cache_file(ctx, &file);
                continue;
            }
            if file.view_ts < horizon.minimum_ts {
                ctx.report.files_skipped += 1;
                continue;
            }
            if file.view_ts > horizon.maximum_ts {
                break;
            }

            tracing::info!(
                file = %file.name,
                view_ts = file.view_ts,
                earliest = horizon.minimum_ts,
                "backfilling events"
            );
            let Some(assembled) = self.assemble_file(ctx, &file) else {
                continue;
            };
            ctx.report.files_scanned += 1;
            let Some(finished) = assembled.finished else {
                continue;
            };

            let finished = ctx.with_warm_records(finished);
            match ctx.tracker.finish_event(self.index, finished, |_| Ok(())) {
                Ok(outcome) => {
                    if outcome.written {
                        ctx.report.events_finished += 1;
                    }
                    let Some(next) = ctx.tracker.horizon() else {
                        ctx.report.early_exit = true;
                        tracing::info!(file = %file.name, "all events finished");
                        break;
                    };
                    if outcome.minimum_changed {
                        tracing::debug!(minimum_ts = next.minimum_ts, "horizon advanced");
                    }
                    horizon = next;
                }
                Err(err) => ctx.report.record_failure(&file, &err),
            }
        }
        Ok(())
    }

    fn run_replay(
        &mut self,
        ctx: &mut BackfillContext,
        event_type: EventType,
        start_ts: u64,
        end_ts: u64,
    ) -> Result<()> {
        let options = self.settings.options;
        if options.load_unfinished {
            ctx.report.loaded = ctx
                .tracker
                .load_unfinished(self.index, event_type, start_ts, end_ts)?;
        }

        let cache_start = start_ts.saturating_sub(self.settings.window_secs);
        let files = self.source.list_files(event_type, cache_start, end_ts)?;
        let cache_count = files.iter().filter(|f| f.view_ts < start_ts).count();
        tracing::info!(
            cache_files = cache_count,
            files = files.len() - cache_count,
            "replaying source files"
        );

        for file in files {
            if file.view_ts < start_ts {
                self.scan_cache_file(ctx, &file);
                continue;
            }
            tracing::info!(file = %file.name, view_ts = file.view_ts, "replaying file");
            let Some(assembled) = self.assemble_file(ctx, &file) else {
                continue;
            };
            ctx.report.files_scanned += 1;
            if let Err(err) = self.replay_assembled(ctx, &file, assembled) {
                ctx.report.record_failure(&file, &err);
            }
        }
        Ok(())
    }

    fn replay_assembled(
        &mut self,
        ctx: &mut BackfillContext,
        file: &SourceFile,
        assembled: AssembledFile,
    ) -> Result<()> {
        let enable_finisher = self.settings.options.enable_finisher;
        let AssembledFile {
            finished,
            also_finished,
            open,
            ..
        } = assembled;

        for event in finished.into_iter().chain(also_finished) {
            let event = ctx.with_warm_records(event);
            let tagger = &mut self.tagger;
            let outcome = ctx.tracker.finish_event(self.index, event, |merged| {
                let Some(tagger) = tagger.as_mut() else {
                    return Ok(());
                };
                tagger.update_datasets(file.view_ts)?;
                tagger.prepare_for_view(file.view_ts)?;
                tagger.tag_event(merged)
            })?;
            if outcome.written {
                ctx.report.events_finished += 1;
            }
        }

        for event in open {
            let event = ctx.with_warm_records(event);
            if enable_finisher {
                ctx.tracker.track_open(self.index, event)?;
            } else {
                persist_partial(self.index, event)?;
            }
            ctx.report.events_partial += 1;
        }
        Ok(())
    }

    fn assemble_file(&self, ctx: &mut BackfillContext, file: &SourceFile) -> Option<AssembledFile> {
        let assembled = self
            .source
            .read_lines(file)
            .map_err(Error::from)
            .and_then(|lines| {
                EventAssembler::new(file.event_type)
                    .with_file(&file.name)
                    .assemble(&lines)
                    .map_err(Error::from)
            });
        match assembled {
            Ok(assembled) => {
                ctx.report.records_rejected += assembled.rejected;
                Some(assembled)
            }
            Err(err) => {
                ctx.report.record_failure(file, &err);
                None
            }
        }
    }

    fn scan_cache_file(&self, ctx: &mut BackfillContext, file: &SourceFile) {
        tracing::debug!(file = %file.name, view_ts = file.view_ts, "caching file");
        let Some(assembled) = self.assemble_file(ctx, file) else {
            return;
        };
        ctx.report.cache_files += 1;

        for event in assembled.open {
            ctx.warm(event);
        }
        for event in assembled.finished.into_iter().chain(assembled.also_finished) {
            if !ctx.tracker.contains(event.event_id()) {
                continue;
            }
            let event = ctx.with_warm_records(event);
            match ctx.tracker.finish_event(self.index, event, |_| Ok(())) {
                Ok(outcome) if outcome.written => ctx.report.events_finished += 1,
                Ok(_) => {}
                Err(err) => ctx.report.record_failure(file, &err),
            }
        }
    }
}

/// Merge an open event into its stored copy without tracking it.
fn persist_partial<I: EventIndex + ?Sized>(index: &I, event: Event) -> Result<()> {
    let id = event.event_id();
    let mut merged = match index.get(id)? {
        Some(stored) if stored.is_finished() => return Ok(()),
        Some(mut stored) => {
            stored.absorb(event)?;
            stored
        }
        None => event,
    };
    merged.touch();
    match index.upsert(&merged) {
        Ok(()) => Ok(()),
        Err(err) => {
            let err = Error::from(err);
            if err.is_oversize() {
                tracing::warn!(event_id = %id, error = %err, "partial event skipped");
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Range splitting
// ---------------------------------------------------------------------------

/// Split `[start, end)` into contiguous half-open slices of
/// `(end - start) / parts` seconds (at least one). The remainder becomes a
/// final, shorter slice.
#[must_use]
pub fn split_range(start: u64, end: u64, parts: usize) -> Vec<(u64, u64)> {
    if end <= start {
        return Vec::new();
    }
    let parts = parts.max(1) as u64;
    let step = ((end - start) / parts).max(1);
    let mut slices = Vec::new();
    let mut cur = start;
    while cur < end {
        let next = cur.saturating_add(step).min(end);
        slices.push((cur, next));
        cur = next;
    }
    slices
}

/// Run one driver per slice of `[start_ts, end_ts]` on `processes` threads,
/// each with its own index connection and tracker, and merge the reports.
///
/// Slice failures are logged; the first one is returned after every slice
/// has run.
#[allow(clippy::too_many_arguments)]
pub fn run_parallel<S, C>(
    source: &S,
    connector: &C,
    factory: Option<&dyn ClassifierFactory>,
    settings: &BackfillSettings,
    event_type: EventType,
    start_ts: u64,
    end_ts: u64,
    processes: usize,
) -> Result<BackfillReport>
where
    S: SourceStore + ?Sized,
    C: IndexConnector,
{
    settings.options.validate()?;
    let processes = processes.max(1);
    if settings.mode == BackfillMode::Replay && settings.options.enable_finisher && processes > 1 {
        return Err(ConfigError::Invalid(
            "the finisher only runs single-threaded; use -p 1 with --enable-finisher".to_string(),
        )
        .into());
    }

    let run_slice = |index: &C::Index, start: u64, end: u64| -> Result<BackfillReport> {
        let mut driver = BackfillDriver::new(source, index, settings.clone());
        if let Some(factory) = factory {
            driver = driver.with_tagger(factory.tagger(&settings.options)?);
        }
        driver.run(event_type, start, Some(end))
    };

    if processes == 1 {
        let index = connector.connect()?;
        return run_slice(&index, start_ts, end_ts);
    }

    let slices = split_range(start_ts, end_ts.saturating_add(1), processes);
    tracing::info!(slices = slices.len(), processes, "running backfill in parallel");
    let (tx, rx) = crossbeam::channel::unbounded::<(u64, u64)>();
    for slice in &slices {
        tx.send(*slice).map_err(|_| PipelineError::QueueClosed)?;
    }
    drop(tx);

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(processes);
        for worker in 0..processes.min(slices.len()) {
            let rx = rx.clone();
            let run_slice = &run_slice;
            let handle = std::thread::Builder::new()
                .name(format!("backfill-{worker}"))
                .spawn_scoped(scope, move || -> (BackfillReport, Vec<Error>) {
                    let mut report = BackfillReport::default();
                    let mut errors = Vec::new();
                    let index = match connector.connect() {
                        Ok(index) => index,
                        Err(err) => {
                            errors.push(Error::from(err));
                            return (report, errors);
                        }
                    };
                    for (start, end) in rx.iter() {
                        match run_slice(&index, start, end - 1) {
                            Ok(slice) => report.merge(slice),
                            Err(err) => {
                                tracing::error!(worker, start, end, error = %err, "backfill slice failed");
                                errors.push(err);
                            }
                        }
                    }
                    (report, errors)
                })
                .map_err(PipelineError::Spawn)?;
            handles.push(handle);
        }

        let mut report = BackfillReport::default();
        let mut first_error = None;
        for handle in handles {
            let name = handle.thread().name().unwrap_or("backfill").to_string();
            let (slice_report, errors) = handle
                .join()
                .map_err(|_| PipelineError::WorkerPanicked(name))?;
            report.merge(slice_report);
            if first_error.is_none() {
                first_error = errors.into_iter().next();
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    })
}
