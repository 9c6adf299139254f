use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context};
use stitchgraph::config::{ConfigOverrides, IoOverrides, RunOverrides, StitchConfig, StorageOverrides};
use stitchgraph::{utils, EventRecord, IdentityResolver, RunParams};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"stitch_run - run identity resolution over one processing window

USAGE:
    stitch_run [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -d, --date <DATE>       Processing date, YYYY-MM-DD [default: yesterday, UTC]
        --full-rebuild      Reprocess the rebuild lookback instead of one day
        --lookback <DAYS>   Days covered by a full rebuild [default: 365]
        --data-dir <DIR>    RocksDB data directory [default: in-memory]
        --repair            Repair the database before opening
    -e, --events <FILE>     Input events (JSON Lines)
    -o, --output <FILE>     Stamped events output (JSON Lines)
        --dot <FILE>        Write a Graphviz export of the resulting clusters
    -h, --help              Print help

ENVIRONMENT:
    STITCH_CONFIG           Path to config file
    STITCH_RUN__PROCESS_DATE, STITCH_STORAGE__DATA_DIR, ...
    RUST_LOG                Log filter [default: info]

CONFIG FILE (stitchgraph.toml):
    [run]
    process_date = "2024-03-01"

    [storage]
    data_dir = "/var/lib/stitchgraph"

    [io]
    events = "/data/events/2024-03-01.jsonl"
    output = "/data/stamped/2024-03-01.jsonl"
"#
    );
}

fn read_events(path: &Path) -> anyhow::Result<Vec<EventRecord>> {
    let file = File::open(path).with_context(|| format!("open events {}", path.display()))?;
    let mut events = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(&line) {
            Ok(event) => events.push(event),
            Err(err) => warn!(line = number + 1, error = %err, "skipping unparseable event"),
        }
    }
    Ok(events)
}

fn write_events(path: &Path, events: &[EventRecord]) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("create output {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    let mut run_overrides = RunOverrides::default();
    let mut storage_overrides = StorageOverrides::default();
    let mut io_overrides = IoOverrides::default();

    if let Some(date) = parse_arg("--date").or_else(|| parse_arg("-d")) {
        run_overrides.process_date = Some(date);
    }
    if has_flag("--full-rebuild") {
        run_overrides.full_rebuild = Some(true);
    }
    if let Some(days) = parse_arg("--lookback") {
        run_overrides.rebuild_lookback_days = Some(days.parse()?);
    }
    if let Some(dir) = parse_arg("--data-dir") {
        storage_overrides.data_dir = Some(dir.into());
    }
    if has_flag("--repair") {
        storage_overrides.repair = Some(true);
    }
    if let Some(events) = parse_arg("--events").or_else(|| parse_arg("-e")) {
        io_overrides.events = Some(events.into());
    }
    if let Some(output) = parse_arg("--output").or_else(|| parse_arg("-o")) {
        io_overrides.output = Some(output.into());
    }
    if let Some(dot) = parse_arg("--dot") {
        io_overrides.dot = Some(dot.into());
    }
    overrides.run = Some(run_overrides);
    overrides.storage = Some(storage_overrides);
    overrides.io = Some(io_overrides);

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("STITCH_CONFIG").ok());
    let config = StitchConfig::load(config_path.as_deref(), overrides)?;

    let params = RunParams::from_config(&config.run)?;
    let events_path = config
        .io
        .events
        .as_deref()
        .ok_or_else(|| anyhow!("no events file given (--events or [io].events)"))?;
    let mut events = read_events(events_path)?;
    info!(events = events.len(), path = %events_path.display(), "events loaded");

    let mut resolver = IdentityResolver::open(&config.storage)?;
    let summary = resolver.run(&mut events, &params)?;

    if let Some(output) = &config.io.output {
        write_events(output, &events)?;
        info!(path = %output.display(), "stamped events written");
    }
    if let Some(dot_path) = &config.io.dot {
        let canonicals = resolver.store().canonical_ids()?;
        let dot = utils::export_to_dot(resolver.store(), &canonicals)?;
        fs::write(dot_path, dot)?;
        info!(path = %dot_path.display(), clusters = canonicals.len(), "graph exported");
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
