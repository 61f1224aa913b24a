//! hijack-backfill-core: offline maintenance for stored BGP hijack events
//!
//! Detectors write per-view result files (one record per line) and store
//! events in a searchable index. Events whose final record never reached the
//! index stay "unfinished". This crate closes them from the archived result
//! files and re-classifies stored events in bulk.
//!
//! # Architecture
//!
//! ```text
//! result files → parser → assembler → tracker → index   (finish / replay)
//!                                        ↑
//!                         index scroll → queue → workers (retag)
//! ```
//!
//! # Modules
//!
//! - `record`: Per-view detector records and event identity
//! - `parser`: Text line decoding into records
//! - `event`: Stored event documents, merging and integrity checks
//! - `assembler`: Group one file's records into events
//! - `index`: Event index abstraction, scrolled queries, in-memory index
//! - `sqlite_index`: SQLite-backed event index
//! - `source`: Result file discovery and reading (plain or gzip)
//! - `tracker`: Open-event set and its look-back horizon
//! - `classify`: Tagger and inference engine seams
//! - `backfill`: Finish and replay drivers, parallel slicing
//! - `retag`: Bounded queue and worker pool for re-classification
//! - `gaps`: Timestamps a retag run has not reached
//! - `export`: Gzip JSON-lines dumps of stored events
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `error`: Error types and remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod assembler;
pub mod backfill;
pub mod classify;
pub mod config;
pub mod error;
pub mod event;
pub mod export;
pub mod gaps;
pub mod index;
pub mod logging;
pub mod parser;
pub mod record;
pub mod retag;
pub mod source;
pub mod sqlite_index;
pub mod tracker;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
