//! Error types for hijack-backfill-core
//!
//! The taxonomy follows the scope at which each error is handled:
//!
//! - [`ParseError`]: a source line violates the record schema. Fatal to the
//!   file being scanned, never to the run.
//! - [`IntegrityError`]: an event fails a consistency check. Handled by
//!   deleting the event, never retried.
//! - [`TransportError`]: the index or object store failed. `Oversize` skips the
//!   one event; anything else ends the current unit of work (file or event).
//! - [`ConfigError`]: invalid configuration, fatal before any work starts.
//! - [`PipelineError`]: broken queue protocol or a dead worker, fatal to the run.

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for hijack-backfill-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Tagging or inference failed for one event
    #[error("Classification error: {0}")]
    Classify(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for write rejections caused by document size.
    #[must_use]
    pub fn is_oversize(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Oversize { .. }))
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Parse(_) => Some(
                Remediation::new(
                    "A source file is corrupt or has the wrong event type. Inspect it and re-run the affected range.",
                )
                .command("Inspect file", "zcat <file> | head")
                .alternative("Check that --type matches the container being scanned."),
            ),
            Self::Transport(err) => Some(err.remediation()),
            Self::Config(_) => Some(
                Remediation::new("Fix the configuration file or command-line flags and retry.")
                    .command("Show usage", "hijack-backfill --help")
                    .alternative("Remove the config file to fall back to defaults."),
            ),
            Self::Pipeline(_) => Some(
                Remediation::new(
                    "The worker pool stopped unexpectedly. Re-run the same range; retagging is idempotent.",
                )
                .command("Re-run", "hijack-backfill retag -t <type> -s <start> -e <end>")
                .alternative("Lower --processes to reduce memory pressure."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the source root and index path exist and are readable."),
            ),
            Self::Integrity(_) | Self::Event(_) | Self::Classify(_) | Self::Json(_) => None,
        }
    }
}

/// A line that does not match the record schema of its event type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("invalid view timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid position: {0:?}")]
    InvalidPosition(String),

    #[error("invalid ASN: {0:?}")]
    InvalidAsn(String),

    #[error("invalid prefix: {0:?}")]
    InvalidPrefix(String),

    #[error("unknown event type: {0:?}")]
    UnknownEventType(String),

    #[error("line {line}: {source}")]
    AtLine {
        line: usize,
        #[source]
        source: Box<ParseError>,
    },
}

impl ParseError {
    /// Attach a 1-based line number.
    #[must_use]
    pub fn at_line(self, line: usize) -> Self {
        Self::AtLine {
            line,
            source: Box::new(self),
        }
    }
}

/// An event whose recorded state is internally inconsistent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("{event_id}: origins of {prefix} do not match AS-path endpoints")]
    OriginPathMismatch { event_id: String, prefix: String },
}

/// Failures talking to the search index or the object store.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The backing store rejected a write because the payload is too large.
    #[error("document {event_id} is {size} bytes, limit is {limit}")]
    Oversize {
        event_id: String,
        size: usize,
        limit: usize,
    },

    /// The scroll cursor was not advanced within its timeout.
    #[error("scroll expired after {elapsed_ms} ms (timeout {timeout_ms} ms)")]
    ScrollExpired { elapsed_ms: u64, timeout_ms: u64 },

    #[error("index backend error: {0}")]
    Backend(String),

    #[error("source read error on {file}: {source}")]
    Source {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Oversize { event_id, .. } => Remediation::new(format!(
                "Event {event_id} exceeds the index document limit and was skipped."
            ))
            .alternative("Raise index.max_document_bytes if the backend allows it."),
            Self::ScrollExpired { .. } => Remediation::new(
                "Workers were slower than the scroll timeout. Increase --scroll-timeout and re-run.",
            )
            .command(
                "Re-run",
                "hijack-backfill retag -t <type> -s <start> -e <end> -T 30m",
            ),
            Self::Backend(_) => Remediation::new(
                "The index backend failed. Check that the index file is readable and not locked.",
            )
            .alternative("Re-run the affected range once the backend is healthy."),
            Self::Source { file, .. } => Remediation::new(format!(
                "Could not read source file {file}. Re-run the range once it is available."
            )),
        }
    }
}

impl From<rusqlite::Error> for TransportError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Violations of the event aggregate invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event {event_id} is finished; rejected record {fingerprint}")]
    AlreadyFinished {
        event_id: String,
        fingerprint: String,
    },

    #[error("event {event_id} already holds record {fingerprint}")]
    DuplicateRecord {
        event_id: String,
        fingerprint: String,
    },

    #[error("record for {found} pushed into event {expected}")]
    KeyMismatch { expected: String, found: String },
}

/// Invalid configuration or options.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("invalid duration {0:?}; expected e.g. 90s, 10m, 1h")]
    InvalidDuration(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Broken invariants of the worker pool itself.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("worker {0} panicked outside item processing")]
    WorkerPanicked(String),

    #[error("work queue closed while items were pending")]
    QueueClosed,

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversize_is_detected() {
        let err = Error::from(TransportError::Oversize {
            event_id: "moas-1".to_string(),
            size: 10,
            limit: 5,
        });
        assert!(err.is_oversize());
        let other = Error::from(TransportError::Backend("down".to_string()));
        assert!(!other.is_oversize());
    }

    #[test]
    fn parse_error_carries_line_number() {
        let err = ParseError::InvalidAsn("x".to_string()).at_line(7);
        assert_eq!(err.to_string(), "line 7: invalid ASN: \"x\"");
    }

    #[test]
    fn remediation_renders_commands() {
        let text = Error::from(PipelineError::QueueClosed)
            .remediation()
            .unwrap()
            .render_plain();
        assert!(text.starts_with("To fix:"));
        assert!(text.contains("hijack-backfill retag"));
    }

    #[test]
    fn integrity_errors_have_no_remediation() {
        let err = Error::from(IntegrityError::OriginPathMismatch {
            event_id: "submoas-1".to_string(),
            prefix: "10.0.0.0/8".to_string(),
        });
        assert!(err.remediation().is_none());
    }
}
