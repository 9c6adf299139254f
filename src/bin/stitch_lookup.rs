use anyhow::anyhow;
use stitchgraph::config::{ConfigOverrides, StitchConfig, StorageOverrides};
use stitchgraph::{DeviceId, IdentifierKind, IdentityResolver};
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
        r#"stitch_lookup - query a stitchgraph identity graph

USAGE:
    stitch_lookup [OPTIONS] <QUERY>

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
        --data-dir <DIR>    RocksDB data directory
    -h, --help              Print help

QUERIES:
        --id <VALUE> --kind <KIND>
                            Canonical id for an identifier
                            (device_id, email_hash, phone_hash, external_id,
                             ad_cookie, session_fingerprint) [kind default: device_id]
        --cluster <ID>      Active links and summary of a canonical id
        --history <ID>      Merges in which an id was either side
        --stats             Graph-wide row counts
"#
    );
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut overrides = ConfigOverrides::default();
    if let Some(dir) = parse_arg("--data-dir") {
        overrides.storage = Some(StorageOverrides {
            data_dir: Some(dir.into()),
            ..StorageOverrides::default()
        });
    }
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("STITCH_CONFIG").ok());
    let config = StitchConfig::load(config_path.as_deref(), overrides)?;
    if config.storage.data_dir.is_none() {
        return Err(anyhow!("no data directory given (--data-dir or [storage].data_dir)"));
    }
    let resolver = IdentityResolver::open(&config.storage)?;

    if let Some(value) = parse_arg("--id") {
        let kind: IdentifierKind = parse_arg("--kind")
            .as_deref()
            .unwrap_or("device_id")
            .parse()?;
        let canonical = resolver.lookup(&value, kind)?;
        println!("{}", serde_json::to_string_pretty(&canonical)?);
    } else if let Some(id) = parse_arg("--cluster") {
        let canonical = DeviceId::new(id);
        let view = resolver.cluster(&canonical)?;
        let summary = resolver.summary(&canonical)?;
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "cluster": view,
                "summary": summary,
            }))?
        );
    } else if let Some(id) = parse_arg("--history") {
        let history = resolver.merge_history(&DeviceId::new(id))?;
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else if has_flag("--stats") {
        println!("{}", serde_json::to_string_pretty(&resolver.stats()?)?);
    } else {
        print_help();
        return Err(anyhow!("no query given"));
    }
    Ok(())
}
