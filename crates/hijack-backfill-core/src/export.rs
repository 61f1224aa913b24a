//! Dump stored events as gzip-compressed JSON lines.

use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::error::Result;
use crate::event::format_ts;
use crate::index::{DEFAULT_QUERY_SIZE, DEFAULT_SCROLL_TIMEOUT, EventIndex, EventQuery, EventScroll};

/// Progress is logged every this many events.
pub const EXPORT_LOG_INTERVAL: usize = 10_000;

/// `events_dump.{type}.{start}.{end}.txt.gz`
#[must_use]
pub fn default_export_name(query: &EventQuery) -> String {
    format!(
        "events_dump.{}.{}.{}.txt.gz",
        query.event_type, query.start_ts, query.end_ts
    )
}

/// Write every event matching `query` to `out` as one JSON document per
/// line, gzip-compressed. Returns the number of events written.
pub fn export_events<I, W>(index: &I, query: &EventQuery, out: W) -> Result<usize>
where
    I: EventIndex + ?Sized,
    W: Write,
{
    let mut encoder = GzEncoder::new(out, Compression::default());
    let mut scroll = EventScroll::new(index, query.clone(), DEFAULT_QUERY_SIZE, DEFAULT_SCROLL_TIMEOUT);
    let mut written = 0;

    while let Some(page) = scroll.next_page()? {
        for event in page {
            serde_json::to_writer(&mut encoder, &event)?;
            encoder.write_all(b"\n")?;
            written += 1;
            if written % EXPORT_LOG_INTERVAL == 0 {
                tracing::info!(
                    written,
                    view_ts = event.view_ts(),
                    time = %format_ts(event.view_ts()),
                    "exporting"
                );
            }
        }
    }
    encoder.finish()?.flush()?;
    tracing::info!(written, event_type = %query.event_type, "export complete");
    Ok(written)
}

/// [`export_events`] into a new file at `path`.
pub fn export_to_file<I: EventIndex + ?Sized>(index: &I, query: &EventQuery, path: &Path) -> Result<usize> {
    let file = std::fs::File::create(path)?;
    export_events(index, query, std::io::BufWriter::new(file))
}
