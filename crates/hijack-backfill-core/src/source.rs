//! Source-file listing and reading.
//!
//! Observation files live in one container per event type
//! (`bgp-hijacks-{type}`) and are named `{type}.{view_ts}.*`, e.g.
//! `moas.1546300800.events.gz`. The view timestamp in the name is the capture
//! time of the file, not the key of the events inside it.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use flate2::read::MultiGzDecoder;
use regex::Regex;

use crate::error::TransportError;
use crate::record::EventType;

/// One candidate source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the container.
    pub name: String,
    pub event_type: EventType,
    /// Capture time parsed from the file name.
    pub view_ts: u64,
}

/// Object-store style listing and reading of observation files.
pub trait SourceStore: Send + Sync {
    /// Files of `event_type` whose time lies in `[start_ts, end_ts]`,
    /// ascending by time.
    fn list_files(
        &self,
        event_type: EventType,
        start_ts: u64,
        end_ts: u64,
    ) -> Result<Vec<SourceFile>, TransportError>;

    /// Every line of `file`, decompressed.
    fn read_lines(&self, file: &SourceFile) -> Result<Vec<String>, TransportError>;
}

static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(moas|submoas|defcon|edges)\.(\d+)\.").unwrap());

/// Extract `(type, view_ts)` from a file name such as `moas.1546300800.events.gz`.
#[must_use]
pub fn parse_file_name(name: &str) -> Option<(EventType, u64)> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let caps = FILE_NAME.captures(base)?;
    let event_type = caps.get(1)?.as_str().parse().ok()?;
    let view_ts = caps.get(2)?.as_str().parse().ok()?;
    Some((event_type, view_ts))
}

// ---------------------------------------------------------------------------
// Local directory tree
// ---------------------------------------------------------------------------

/// Container directories under a local root: `<root>/bgp-hijacks-{type}/**`.
#[derive(Debug, Clone)]
pub struct LocalSourceStore {
    root: PathBuf,
}

impl LocalSourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container(&self, event_type: EventType) -> PathBuf {
        self.root.join(event_type.container())
    }
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

impl SourceStore for LocalSourceStore {
    fn list_files(
        &self,
        event_type: EventType,
        start_ts: u64,
        end_ts: u64,
    ) -> Result<Vec<SourceFile>, TransportError> {
        let container = self.container(event_type);
        if !container.is_dir() {
            tracing::warn!(container = %container.display(), "source container missing");
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        walk(&container, &mut paths).map_err(|source| TransportError::Source {
            file: container.display().to_string(),
            source,
        })?;

        let mut files: Vec<SourceFile> = paths
            .iter()
            .filter_map(|path| {
                let rel = path.strip_prefix(&container).ok()?;
                let name = rel.to_string_lossy().replace('\\', "/");
                let (kind, view_ts) = parse_file_name(&name)?;
                (kind == event_type && (start_ts..=end_ts).contains(&view_ts)).then_some(
                    SourceFile {
                        name,
                        event_type,
                        view_ts,
                    },
                )
            })
            .collect();
        files.sort_by(|a, b| a.view_ts.cmp(&b.view_ts).then_with(|| a.name.cmp(&b.name)));
        Ok(files)
    }

    fn read_lines(&self, file: &SourceFile) -> Result<Vec<String>, TransportError> {
        let path = self.container(file.event_type).join(&file.name);
        let source_err = |source| TransportError::Source {
            file: file.name.clone(),
            source,
        };
        let handle = std::fs::File::open(&path).map_err(source_err)?;
        let reader: Box<dyn Read> = if file.name.ends_with(".gz") {
            Box::new(MultiGzDecoder::new(handle))
        } else {
            Box::new(handle)
        };
        BufReader::new(reader)
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(source_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn write_gz(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut enc = GzEncoder::new(std::fs::File::create(path).unwrap(), Compression::default());
        enc.write_all(body.as_bytes()).unwrap();
        enc.finish().unwrap();
    }

    #[test]
    fn file_name_parsing() {
        assert_eq!(
            parse_file_name("moas.1546300800.events.gz"),
            Some((EventType::Moas, 1_546_300_800))
        );
        assert_eq!(
            parse_file_name("2019/01/submoas.100.events.gz"),
            Some((EventType::Submoas, 100))
        );
        assert_eq!(parse_file_name("moas.events.gz"), None);
        assert_eq!(parse_file_name("README"), None);
    }

    #[test]
    fn lists_nested_files_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("bgp-hijacks-moas");
        write_gz(&container.join("b/moas.300.events.gz"), "");
        write_gz(&container.join("a/moas.100.events.gz"), "");
        write_gz(&container.join("moas.200.events.gz"), "");
        write_gz(&container.join("moas.900.events.gz"), "");
        write_gz(&container.join("edges.150.events.gz"), "");
        std::fs::write(container.join("notes.txt"), "x").unwrap();

        let store = LocalSourceStore::new(dir.path());
        let files = store.list_files(EventType::Moas, 100, 300).unwrap();
        let tses: Vec<u64> = files.iter().map(|f| f.view_ts).collect();
        assert_eq!(tses, vec![100, 200, 300]);
        assert_eq!(files[0].name, "a/moas.100.events.gz");
    }

    #[test]
    fn missing_container_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalSourceStore::new(dir.path());
        assert!(store.list_files(EventType::Defcon, 0, u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn reads_gzip_and_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("bgp-hijacks-edges");
        write_gz(&container.join("edges.10.events.gz"), "# c\nline one\nline two\n");
        std::fs::write(container.join("edges.20.events"), "plain\n").unwrap();

        let store = LocalSourceStore::new(dir.path());
        let files = store.list_files(EventType::Edges, 0, 100).unwrap();
        assert_eq!(
            store.read_lines(&files[0]).unwrap(),
            vec!["# c", "line one", "line two"]
        );
        assert_eq!(store.read_lines(&files[1]).unwrap(), vec!["plain"]);
    }

    #[test]
    fn unreadable_file_is_a_source_error() {
        let store = LocalSourceStore::new("/nonexistent-root");
        let file = SourceFile {
            name: "moas.1.events.gz".to_string(),
            event_type: EventType::Moas,
            view_ts: 1,
        };
        assert!(matches!(
            store.read_lines(&file),
            Err(TransportError::Source { .. })
        ));
    }
}
