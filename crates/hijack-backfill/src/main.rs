//! hijack-backfill CLI
//!
//! Finish, replay and retag historical routing-anomaly events stored in the
//! event index. Reports are printed to stdout as JSON; logs go to stderr
//! (and optionally a file).

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use hijack_backfill_core::backfill::{BackfillMode, BackfillSettings, run_parallel};
use hijack_backfill_core::classify::{BaselineClassifier, ClassifierFactory, TaggerOptions};
use hijack_backfill_core::config::{Config, LogFormat, parse_duration, resolve_processes};
use hijack_backfill_core::event::{format_ts, unix_now};
use hijack_backfill_core::export::{default_export_name, export_to_file};
use hijack_backfill_core::gaps::{GapReport, find_unretagged_timerange};
use hijack_backfill_core::index::{EventQuery, IndexConnector};
use hijack_backfill_core::logging::init_logging;
use hijack_backfill_core::record::EventType;
use hijack_backfill_core::retag::{RetagConfig, RetagPipeline};
use hijack_backfill_core::source::LocalSourceStore;
use hijack_backfill_core::sqlite_index::{IndexNamespace, SqliteConnector};

#[derive(Parser, Debug)]
#[command(
    name = "hijack-backfill",
    version,
    about = "Backfill and retag historical BGP hijack events"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "HIJACK_BACKFILL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Append logs to this file as well
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// SQLite index file (overrides index.path)
    #[arg(long, global = true)]
    index_path: Option<PathBuf>,

    /// Root holding the bgp-hijacks-{type} directories (overrides source.root)
    #[arg(long, global = true)]
    source_root: Option<PathBuf>,

    /// Write to the test namespace instead of production
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

/// Event type and inclusive `view_ts` range.
#[derive(Args, Debug)]
struct RangeArgs {
    /// Event type: moas, submoas, defcon or edges
    #[arg(short = 't', long = "type")]
    event_type: EventType,

    /// Start time (unix seconds, RFC 3339 or YYYY-MM-DD)
    #[arg(short = 's', long, value_parser = parse_ts)]
    start: u64,

    /// End time, inclusive
    #[arg(short = 'e', long, value_parser = parse_ts)]
    end: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Complete stored partial events from archived result files
    Finish {
        #[arg(short = 't', long = "type")]
        event_type: EventType,

        #[arg(short = 's', long, value_parser = parse_ts)]
        start: u64,

        /// End time, inclusive; defaults to now
        #[arg(short = 'e', long, value_parser = parse_ts)]
        end: Option<u64>,

        /// Parallel slices; 0 means all cores
        #[arg(short = 'p', long, default_value_t = 1)]
        processes: usize,
    },

    /// Replay every result file in range, writing new events
    Replay {
        #[command(flatten)]
        range: RangeArgs,

        /// Parallel slices; 0 means all cores
        #[arg(short = 'p', long, default_value_t = 1)]
        processes: usize,

        /// Track open events and close them as their final records arrive
        #[arg(short = 'E', long)]
        enable_finisher: bool,

        /// Seed the open set from stored unfinished events (needs -E)
        #[arg(long)]
        load_unfinished: bool,
    },

    /// Re-tag and re-infer stored events
    Retag {
        #[command(flatten)]
        range: RangeArgs,

        /// Worker threads; 0 means all cores (defaults to retag.processes)
        #[arg(short = 'p', long)]
        processes: Option<usize>,

        /// Events per page (defaults to index.query_size)
        #[arg(short = 'q', long)]
        query_size: Option<usize>,

        /// Scroll validity between pages, e.g. 10m (defaults to index.scroll_timeout)
        #[arg(short = 'T', long, value_parser = parse_duration_arg)]
        scroll_timeout: Option<std::time::Duration>,

        /// Only re-run inference
        #[arg(long)]
        reinference: bool,

        /// Only events without a primary inference
        #[arg(long)]
        missing_inference: bool,

        #[arg(short = 'i', long, value_parser = parse_ts)]
        inserted_before: Option<u64>,

        #[arg(short = 'I', long, value_parser = parse_ts)]
        inserted_after: Option<u64>,

        #[arg(short = 'm', long, value_parser = parse_ts)]
        modified_before: Option<u64>,

        #[arg(short = 'M', long, value_parser = parse_ts)]
        modified_after: Option<u64>,

        /// Only events carrying any of these tags
        #[arg(long, value_delimiter = ',')]
        must_tags: Vec<String>,

        /// Skip events carrying any of these tags
        #[arg(long, value_delimiter = ',')]
        must_not_tags: Vec<String>,
    },

    /// List view timestamps not yet retagged since a cutoff
    FindGaps {
        #[command(flatten)]
        range: RangeArgs,

        /// Events modified before this time count as unprocessed
        #[arg(short = 'c', long, value_parser = parse_ts)]
        cutoff: u64,

        /// Output CSV (defaults to {type}_event_retag_tses.csv)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },

    /// Dump stored events as gzip JSON lines
    Export {
        #[command(flatten)]
        range: RangeArgs,

        /// Output file (defaults to events_dump.{type}.{start}.{end}.txt.gz)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
}

/// Accept unix seconds, RFC 3339, or a bare `YYYY-MM-DD` (UTC midnight).
fn parse_ts(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(secs);
    }
    let secs = if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        dt.timestamp()
    } else {
        chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| format!("invalid time {raw:?}; expected unix seconds, RFC 3339 or YYYY-MM-DD"))?
    };
    u64::try_from(secs).map_err(|_| format!("time {raw:?} is before 1970"))
}

fn parse_duration_arg(raw: &str) -> Result<std::time::Duration, String> {
    parse_duration(raw).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<hijack_backfill_core::Error>()
                .and_then(hijack_backfill_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = &cli.log_level {
        config.log.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    if let Some(file) = &cli.log_file {
        config.log.file = Some(file.clone());
    }
    if let Some(path) = &cli.index_path {
        config.index.path.clone_from(path);
    }
    if let Some(root) = &cli.source_root {
        config.source.root.clone_from(root);
    }
    config.validate()?;
    Ok(config)
}

fn connector(config: &Config, debug: bool) -> SqliteConnector {
    SqliteConnector {
        path: config.index.path.clone(),
        namespace: IndexNamespace::from_debug(debug),
        max_document_bytes: config.index.max_document_bytes,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn check_range(start: u64, end: u64) -> anyhow::Result<()> {
    if end < start {
        bail!(
            "end {} ({}) is before start {} ({})",
            end,
            format_ts(end),
            start,
            format_ts(start)
        );
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.log).context("initializing logging")?;
    tracing::debug!(?config, "configuration loaded");

    let connector = connector(&config, cli.debug);
    let source = LocalSourceStore::new(&config.source.root);
    let settings = BackfillSettings {
        window_secs: config.backfill.window_secs,
        lookback_slack_secs: config.backfill.lookback_slack_secs,
        ..BackfillSettings::default()
    };

    match cli.command {
        Command::Finish {
            event_type,
            start,
            end,
            processes,
        } => {
            let end = end.unwrap_or_else(unix_now);
            check_range(start, end)?;
            let report = run_parallel(
                &source,
                &connector,
                None,
                &settings,
                event_type,
                start,
                end,
                resolve_processes(processes),
            )?;
            print_json(&report)
        }

        Command::Replay {
            range,
            processes,
            enable_finisher,
            load_unfinished,
        } => {
            check_range(range.start, range.end)?;
            let options = TaggerOptions::builder()
                .in_memory_data(true)
                .force_process_view(true)
                .enable_finisher(enable_finisher)
                .load_unfinished(load_unfinished)
                .debug(cli.debug)
                .build()?;
            let settings = BackfillSettings {
                mode: BackfillMode::Replay,
                options,
                ..settings
            };
            let factory: &dyn ClassifierFactory = &BaselineClassifier;
            let report = run_parallel(
                &source,
                &connector,
                Some(factory),
                &settings,
                range.event_type,
                range.start,
                range.end,
                resolve_processes(processes),
            )?;
            print_json(&report)
        }

        Command::Retag {
            range,
            processes,
            query_size,
            scroll_timeout,
            reinference,
            missing_inference,
            inserted_before,
            inserted_after,
            modified_before,
            modified_after,
            must_tags,
            must_not_tags,
        } => {
            check_range(range.start, range.end)?;
            let mut query = EventQuery::range(range.event_type, range.start, range.end);
            query.inserted_before = inserted_before;
            query.inserted_after = inserted_after;
            query.modified_before = modified_before;
            query.modified_after = modified_after;
            query.missing_inference = missing_inference;
            query.must_tags = must_tags;
            query.must_not_tags = must_not_tags;

            let mut retag = RetagConfig::new(query);
            retag.processes = resolve_processes(processes.unwrap_or(config.retag.processes));
            retag.query_size = query_size.unwrap_or(config.index.query_size);
            retag.scroll_timeout = match scroll_timeout {
                Some(timeout) => timeout,
                None => config.scroll_timeout()?,
            };
            retag.reinference = reinference;
            retag.options.debug = cli.debug;

            let report =
                RetagPipeline::new(Arc::new(connector), Arc::new(BaselineClassifier), retag).run()?;
            print_json(&report)
        }

        Command::FindGaps {
            range,
            cutoff,
            output,
        } => {
            check_range(range.start, range.end)?;
            let index = connector.connect()?;
            let report =
                find_unretagged_timerange(&index, range.event_type, range.start, range.end, cutoff)?;
            let output = output
                .unwrap_or_else(|| PathBuf::from(GapReport::default_file_name(range.event_type)));
            let file = File::create(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            report.write_csv(BufWriter::new(file))?;
            print_json(&serde_json::json!({
                "output": output,
                "timestamps": report.timestamps.len(),
                "unprocessed": report.unprocessed().count(),
                "events_scanned": report.events_scanned,
                "recurring_seen": report.recurring_seen,
            }))
        }

        Command::Export { range, output } => {
            check_range(range.start, range.end)?;
            let index = connector.connect()?;
            let query = EventQuery::range(range.event_type, range.start, range.end);
            let output = output.unwrap_or_else(|| PathBuf::from(default_export_name(&query)));
            let written = export_to_file(&index, &query, &output)?;
            print_json(&serde_json::json!({
                "output": output,
                "events": written,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_ts_accepts_three_forms() {
        assert_eq!(parse_ts("1546300800").unwrap(), 1_546_300_800);
        assert_eq!(parse_ts("2019-01-01").unwrap(), 1_546_300_800);
        assert_eq!(parse_ts("2019-01-01T01:00:00Z").unwrap(), 1_546_304_400);
        assert!(parse_ts("yesterday").is_err());
        assert!(parse_ts("1960-01-01").is_err());
    }

    #[test]
    fn retag_flags_parse() {
        let cli = Cli::try_parse_from([
            "hijack-backfill",
            "retag",
            "-t",
            "submoas",
            "-s",
            "100",
            "-e",
            "200",
            "-q",
            "50",
            "-T",
            "2m",
            "--must-not-tags",
            "a,b",
        ])
        .unwrap();
        let Command::Retag {
            query_size,
            scroll_timeout,
            must_not_tags,
            ..
        } = cli.command
        else {
            panic!("expected retag");
        };
        assert_eq!(query_size, Some(50));
        assert_eq!(scroll_timeout, Some(std::time::Duration::from_secs(120)));
        assert_eq!(must_not_tags, vec!["a".to_string(), "b".to_string()]);
    }
}
