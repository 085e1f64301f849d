//! 🚀 s3zip-cli: the front door. Parses args, sets up logging, loads config,
//! lists the prefix, and hands the key list to the library.
//!
//! 🎬 *[narrator voice]* "It started with one bucket and ten thousand tiny files..." 🦆

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use comfy_table::{Cell, CellAlignment, Table, presets::UTF8_FULL};
use s3zip::app_config::{AppConfig, StoreConfig, load_config};
use s3zip::backends::{FileStoreConfig, ObjectStore, StoreBackend};
use s3zip::progress::{NoProgress, ProgressMetrics, ProgressSink, format_bytes, format_number};
use s3zip::{JobDescriptor, RunSummary, Supervisor};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 📂 Picked up automatically when `--config` is not given and it exists in the cwd.
const DEFAULT_CONFIG_FILE: &str = "s3zip.toml";

/// Zip every object under an S3 prefix into one archive object in the same bucket.
#[derive(Debug, Parser)]
#[command(name = "s3zip", version)]
struct Cli {
    /// Bucket holding the source objects; the archive is written there too.
    bucket: String,

    /// Key prefix to archive. Every object under it becomes one archive entry.
    prefix: String,

    /// AWS region of the bucket.
    region: Option<String>,

    /// Static access key id. Needs the secret key right after it.
    #[arg(requires = "secret_key")]
    access_key: Option<String>,

    /// Static secret access key.
    secret_key: Option<String>,

    /// TOML config file. Defaults to ./s3zip.toml when present.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Destination key for the archive. Defaults to `<prefix>.<unix-seconds>.zip`.
    #[arg(long, value_name = "KEY")]
    output_key: Option<String>,

    /// Custom endpoint for S3-compatible stores (MinIO, LocalStack, ...).
    #[arg(long, value_name = "URL")]
    endpoint_url: Option<String>,

    /// Use a local directory as the object store; buckets are its subdirectories.
    #[arg(long, value_name = "DIR", conflicts_with_all = ["region", "endpoint_url", "access_key"])]
    store_root: Option<PathBuf>,

    /// No progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Print the run summary as JSON on stdout instead of a table.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn wants_s3(&self) -> bool {
        self.region.is_some() || self.endpoint_url.is_some() || self.access_key.is_some()
    }

    fn config_file(&self) -> Option<PathBuf> {
        match &self.config {
            Some(path) => Some(path.clone()),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                fallback.is_file().then_some(fallback)
            }
        }
    }
}

/// 🔧 Flags beat config. Config beats defaults. Defaults beat nothing.
fn apply_overrides(cli: &Cli, config: &mut AppConfig) -> Result<()> {
    if let Some(root) = &cli.store_root {
        config.store = StoreConfig::File(FileStoreConfig { root: root.clone() });
    }
    if cli.wants_s3() {
        let StoreConfig::S3(s3) = &mut config.store else {
            bail!(
                "💀 S3 options (region, endpoint, credentials) were given, but the configured store is {:?}",
                config.store
            );
        };
        if let Some(region) = &cli.region {
            s3.region = region.clone();
        }
        if let Some(endpoint) = &cli.endpoint_url {
            s3.endpoint_url = Some(endpoint.clone());
            // -- 🏠 self-hosted S3 lookalikes rarely do virtual-host buckets
            s3.force_path_style = true;
        }
        if let (Some(key), Some(secret)) = (&cli.access_key, &cli.secret_key) {
            s3.access_key_id = Some(key.clone());
            s3.secret_access_key = Some(secret.clone());
        }
    }
    config
        .validate()
        .context("💀 The configuration stopped making sense once the command-line flags were applied")
}

fn summary_table(summary: &RunSummary) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["archive", "attempted", "transferred", "skipped", "failed", "size"]);
    table.add_row(vec![
        Cell::new(&summary.destination_key),
        Cell::new(format_number(summary.attempted as u64)).set_alignment(CellAlignment::Right),
        Cell::new(format_number(summary.transferred as u64)).set_alignment(CellAlignment::Right),
        Cell::new(format_number(summary.skipped as u64)).set_alignment(CellAlignment::Right),
        Cell::new(format_number(summary.failed as u64)).set_alignment(CellAlignment::Right),
        Cell::new(format_bytes(summary.archive_bytes)).set_alignment(CellAlignment::Right),
    ]);
    table
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = cli.config_file();
    let mut app_config = load_config(config_file.as_deref())
        .context("💀 Couldn't load the configuration. Check the file and any S3ZIP_* variables")?;
    apply_overrides(&cli, &mut app_config)?;

    let store = StoreBackend::from_config(&app_config.store)
        .await
        .context("💀 Couldn't set up the object store")?;
    let keys = store
        .list_keys(&cli.bucket, &cli.prefix)
        .await
        .with_context(|| format!("💀 Couldn't list s3://{}/{}", cli.bucket, cli.prefix))?;
    info!("📚 found {} keys under s3://{}/{}", keys.len(), cli.bucket, cli.prefix);

    let job = match &cli.output_key {
        Some(key) => JobDescriptor::new(&cli.bucket, &cli.prefix, keys, key),
        None => JobDescriptor::with_default_destination(&cli.bucket, &cli.prefix, keys),
    };

    let progress: Arc<dyn ProgressSink> = if cli.no_progress || cli.json {
        Arc::new(NoProgress)
    } else {
        Arc::new(ProgressMetrics::new(
            format!("s3://{}/{} → {}", job.bucket(), job.prefix(), job.destination_key()),
            job.attemptable_keys(),
        ))
    };

    let supervisor = Supervisor::new(Arc::new(store), app_config.pipeline).with_progress(progress);
    let summary = supervisor
        .run(&job)
        .await
        .with_context(|| format!("💀 The archive '{}' was not written", job.destination_key()))?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("💀 Couldn't serialize the run summary")?
        );
    } else {
        println!("{}", summary_table(&summary));
        for outcome in summary.outcomes.iter().filter(|o| o.reason.is_some()) {
            println!(
                "  {:?} '{}': {}",
                outcome.status,
                outcome.key,
                outcome.reason.as_deref().unwrap_or_default()
            );
        }
    }
    Ok(())
}

/// 🕵️ Sniff the error chain for the usual suspects and say something useful about them.
fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    let chain = err
        .chain()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(" | ");
    if chain.contains("dispatch failure")
        || chain.contains("connection refused")
        || chain.contains("Connection refused")
        || chain.contains("dns error")
        || chain.contains("timed out")
    {
        Some(
            "🔧 hint: the object store isn't reachable. Check the region and --endpoint-url, \
             and if it's a local MinIO/LocalStack, that the container is actually up. ☕",
        )
    } else if chain.contains("access denied")
        || chain.contains("credentials")
        || chain.contains("AccessDenied")
    {
        Some(
            "🔧 hint: the store said no. Check AWS_PROFILE / AWS_ACCESS_KEY_ID, or pass \
             access-key and secret-key after the region.",
        )
    } else {
        None
    }
}

#[tokio::main]
async fn main() {
    // 📡 stderr, so the summary on stdout stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("💀 error: {}", err);
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
        }
        if let Some(hint) = hint_for(&err) {
            error!("{hint}");
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3zip::backends::S3StoreConfig;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("s3zip").chain(args.iter().copied()))
            .expect("args should parse")
    }

    #[test]
    fn the_one_where_the_positional_forms_all_parse() {
        let cli = parse(&["bucket", "photos/"]);
        assert_eq!((cli.bucket.as_str(), cli.prefix.as_str()), ("bucket", "photos/"));
        assert!(cli.region.is_none());

        let cli = parse(&["bucket", "photos/", "eu-west-1", "AKIA", "shh"]);
        assert_eq!(cli.region.as_deref(), Some("eu-west-1"));
        assert_eq!(cli.access_key.as_deref(), Some("AKIA"));
        assert_eq!(cli.secret_key.as_deref(), Some("shh"));
    }

    #[test]
    fn the_one_where_an_access_key_without_a_secret_is_rejected() {
        let parsed = Cli::try_parse_from(["s3zip", "bucket", "p/", "eu-west-1", "AKIA"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn the_one_where_flags_beat_the_config_file() {
        let cli = parse(&[
            "bucket",
            "p/",
            "ap-south-1",
            "AKIA",
            "shh",
            "--endpoint-url",
            "http://localhost:9000",
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&cli, &mut config).expect("overrides");

        assert_eq!(
            config.store,
            StoreConfig::S3(S3StoreConfig {
                region: "ap-south-1".into(),
                endpoint_url: Some("http://localhost:9000".into()),
                force_path_style: true,
                access_key_id: Some("AKIA".into()),
                secret_access_key: Some("shh".into()),
                session_token: None,
            })
        );
    }

    #[test]
    fn the_one_where_a_store_root_swaps_in_the_filesystem() {
        let cli = parse(&["bucket", "p/", "--store-root", "/tmp/buckets"]);
        let mut config = AppConfig::default();
        apply_overrides(&cli, &mut config).expect("overrides");
        assert_eq!(
            config.store,
            StoreConfig::File(FileStoreConfig {
                root: PathBuf::from("/tmp/buckets")
            })
        );
    }

    #[test]
    fn the_one_where_s3_flags_meet_a_non_s3_store() {
        let cli = parse(&["bucket", "p/", "us-west-2"]);
        let mut config = AppConfig {
            store: StoreConfig::InMemory,
            ..AppConfig::default()
        };
        assert!(apply_overrides(&cli, &mut config).is_err());
    }

    #[test]
    fn the_one_where_a_refused_connection_gets_a_hint() {
        let err = anyhow::anyhow!("Connection refused (os error 111)").context("listing failed");
        assert!(hint_for(&err).is_some_and(|h| h.contains("reachable")));
        assert!(hint_for(&anyhow::anyhow!("nope")).is_none());
    }
}
