//! bucketfs -- command-line access to any supported bucket.
//!
//! Every subcommand takes a bucket URL (`file:///data`, `mem://x`,
//! `s3://bucket/prefix`, `gs://bucket/prefix`).  The URL `-` selects the
//! bucket described by the `storage` section of the configuration file.

use std::collections::HashMap;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use bucketfs::config::{load_config, Config};
use bucketfs::{Bucket, WriteOptions};

/// Command-line arguments for the bucketfs tool.
#[derive(Parser, Debug)]
#[command(
    name = "bucketfs",
    version,
    about = "Uniform bucket access for local disk, S3 and GCS"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Print Prometheus metrics to stderr after the command finishes.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List objects matching a glob pattern.
    Ls {
        url: String,
        #[arg(default_value = "**")]
        pattern: String,
    },
    /// Show an object's meta information as JSON.
    Head { url: String, name: String },
    /// Write an object's contents to stdout.
    Cat { url: String, name: String },
    /// Upload a local file.
    Put {
        url: String,
        name: String,
        file: String,
        /// Content type stored with the object.
        #[arg(long)]
        content_type: Option<String>,
        /// User metadata, as key=value (repeatable).
        #[arg(long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },
    /// Remove an object.
    Rm { url: String, name: String },
    /// Copy an object within a bucket.
    Cp { url: String, src: String, dst: String },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

/// Initialize tracing from the logging config; `RUST_LOG` takes precedence.
fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_bucket(url: &str, config: &Config) -> anyhow::Result<Box<dyn Bucket>> {
    if url == "-" {
        debug!("using configured storage backend '{}'", config.storage.backend);
        return Ok(config.storage.open().await?);
    }
    Ok(bucketfs::connect(url).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => load_config(path).with_context(|| format!("loading {path}"))?,
        None => Config::default(),
    };
    init_logging(&config);

    if cli.metrics {
        bucketfs::metrics::init_metrics();
        bucketfs::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    run(cli.command, &config).await?;

    if cli.metrics {
        if let Some(text) = bucketfs::metrics::render() {
            eprint!("{text}");
        }
    }
    Ok(())
}

async fn run(command: Command, config: &Config) -> anyhow::Result<()> {
    match command {
        Command::Ls { url, pattern } => {
            let bucket = open_bucket(&url, config).await?;
            let mut iter = bucket.glob(&pattern)?;
            while iter.next().await {
                println!(
                    "{:>12}  {}  {}",
                    iter.size(),
                    iter.mod_time().to_rfc3339(),
                    iter.name()
                );
            }
            if let Some(err) = iter.error() {
                anyhow::bail!("listing failed: {err}");
            }
            bucket.close().await?;
        }
        Command::Head { url, name } => {
            let bucket = open_bucket(&url, config).await?;
            let info = bucket.head(&name).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            bucket.close().await?;
        }
        Command::Cat { url, name } => {
            let bucket = open_bucket(&url, config).await?;
            let mut reader = bucket.open(&name).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
            bucket.close().await?;
        }
        Command::Put {
            url,
            name,
            file,
            content_type,
            meta,
        } => {
            let bucket = open_bucket(&url, config).await?;
            let opts = WriteOptions {
                content_type,
                metadata: (!meta.is_empty()).then(|| meta.into_iter().collect::<HashMap<_, _>>()),
            };

            let mut writer = bucket.create(&name, opts).await?;
            let mut input =
                std::fs::File::open(&file).with_context(|| format!("opening {file}"))?;
            let written = std::io::copy(&mut input, &mut writer)?;
            writer.commit().await?;
            info!("uploaded {} bytes to {}", written, name);
            bucket.close().await?;
        }
        Command::Rm { url, name } => {
            let bucket = open_bucket(&url, config).await?;
            bucket.remove(&name).await?;
            bucket.close().await?;
        }
        Command::Cp { url, src, dst } => {
            let bucket = open_bucket(&url, config).await?;
            bucket.copy(&src, &dst).await?;
            bucket.close().await?;
        }
    }
    Ok(())
}
