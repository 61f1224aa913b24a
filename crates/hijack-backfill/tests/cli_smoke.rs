//! CLI smoke tests.
//!
//! Every run points `--index-path` and `--source-root` into a temp dir so no
//! real index or archive is touched.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use assert_cmd::Command;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hijack_backfill_core::event::Event;
use hijack_backfill_core::index::EventIndex;
use hijack_backfill_core::parser::PrefixRecordParser;
use hijack_backfill_core::record::{EventId, EventType};
use hijack_backfill_core::sqlite_index::{DEFAULT_MAX_DOCUMENT_BYTES, IndexNamespace, SqliteEventIndex};
use predicates::prelude::*;

#[allow(deprecated)]
fn cli(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("hijack-backfill").expect("hijack-backfill binary should be built");
    cmd.env_remove("RUST_LOG")
        .env_remove("HIJACK_BACKFILL_CONFIG")
        .arg("--index-path")
        .arg(dir.join("index.db"))
        .arg("--source-root")
        .arg(dir.join("archive"));
    cmd
}

fn open_index(dir: &Path, namespace: IndexNamespace) -> SqliteEventIndex {
    SqliteEventIndex::open(dir.join("index.db"), namespace, DEFAULT_MAX_DOCUMENT_BYTES).unwrap()
}

fn moas_line(view_ts: u64, position: &str) -> String {
    format!("{view_ts}|{position}|192.0.2.0/24|64500 64501|64500|1 64500:2 64501")
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("finish"))
        .stdout(predicate::str::contains("retag"))
        .stdout(predicate::str::contains("find-gaps"));
}

#[test]
fn missing_type_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["finish", "-s", "1000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--type"));
}

#[test]
fn unknown_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["finish", "-t", "bogus", "-s", "1000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bogus"));
}

#[test]
fn finish_over_empty_source_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["finish", "-t", "moas", "-s", "1000", "-e", "2000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"loaded\": 0"));
}

#[test]
fn end_before_start_fails() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["finish", "-t", "moas", "-s", "2000", "-e", "1000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("before start"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, "[index]\nquery_size = 0\n").unwrap();
    cli(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["finish", "-t", "moas", "-s", "1000", "-e", "2000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("query_size"));
}

#[test]
fn finish_completes_partial_event_from_archive() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = open_index(dir.path(), IndexNamespace::Production);
        let record = PrefixRecordParser::new(EventType::Moas)
            .parse(&moas_line(1000, "NEW"))
            .unwrap()
            .unwrap();
        index.upsert(&Event::from_record(record)).unwrap();
    }

    let container = dir.path().join("archive").join(EventType::Moas.container());
    fs::create_dir_all(&container).unwrap();
    let file = fs::File::create(container.join("moas.1300.events.gz")).unwrap();
    let mut enc = GzEncoder::new(file, Compression::default());
    writeln!(enc, "{}", moas_line(1000, "FINISHED")).unwrap();
    enc.finish().unwrap();

    cli(dir.path())
        .args(["finish", "-t", "moas", "-s", "1000", "-e", "2000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"events_finished\": 1"));

    let index = open_index(dir.path(), IndexNamespace::Production);
    let event = index.get(EventId::new(EventType::Moas, 1000)).unwrap().unwrap();
    assert!(event.is_finished());
    assert_eq!(event.records().len(), 2);
}

#[test]
fn debug_flag_uses_test_namespace() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = open_index(dir.path(), IndexNamespace::Test);
        let record = PrefixRecordParser::new(EventType::Moas)
            .parse(&moas_line(1000, "FINISHED"))
            .unwrap()
            .unwrap();
        index.upsert(&Event::from_record(record)).unwrap();
    }

    cli(dir.path())
        .args(["--debug", "retag", "-t", "moas", "-s", "0", "-e", "5000", "-p", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"retagged\": 1"));

    let production = open_index(dir.path(), IndexNamespace::Production);
    assert_eq!(production.count(EventType::Moas).unwrap(), 0);
    let test = open_index(dir.path(), IndexNamespace::Test);
    let event = test.get(EventId::new(EventType::Moas, 1000)).unwrap().unwrap();
    assert!(event.summary.has_inference());
}

#[test]
fn find_gaps_writes_csv() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = open_index(dir.path(), IndexNamespace::Production);
        let record = PrefixRecordParser::new(EventType::Moas)
            .parse(&moas_line(1000, "FINISHED"))
            .unwrap()
            .unwrap();
        index.upsert(&Event::from_record(record)).unwrap();
    }
    let out = dir.path().join("gaps.csv");

    cli(dir.path())
        .args(["find-gaps", "-t", "moas", "-s", "0", "-e", "5000", "-c", "0", "-o"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"unprocessed\": 0"));

    assert_eq!(fs::read_to_string(&out).unwrap(), "timestamp,processed\n1000,Y\n");
}

#[test]
fn export_writes_gzip_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = open_index(dir.path(), IndexNamespace::Production);
        let parser = PrefixRecordParser::new(EventType::Moas);
        for ts in [1000, 2000] {
            let record = parser.parse(&moas_line(ts, "FINISHED")).unwrap().unwrap();
            index.upsert(&Event::from_record(record)).unwrap();
        }
    }
    let out = dir.path().join("dump.txt.gz");

    cli(dir.path())
        .args(["export", "-t", "moas", "-s", "0", "-e", "5000", "-o"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"events\": 2"));

    let mut text = String::new();
    GzDecoder::new(fs::File::open(&out).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    let events: Vec<Event> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].view_ts(), 1000);
}
