//! Media Fetch - Entry Point
//!
//! Operator tool over the fetch layer: fetch one endpoint, warm one image,
//! sweep or inspect a disk cache namespace.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use media_fetch::{FetchConfig, ImageProxy, Payload, RemoteClient, RequestOptions};

#[derive(Parser, Debug)]
#[command(name = "media-fetch")]
#[command(about = "Rate-limited, cached fetches and disk image cache maintenance")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Disk image cache root
    #[arg(long, env = "MEDIA_FETCH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch one endpoint and print the decoded body
    Get {
        /// Base URL, may embed user:pass@ credentials
        base_url: String,
        /// Endpoint path appended to the base URL
        endpoint: String,
        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,
        /// Extra header as name=value (repeatable)
        #[arg(short = 'H', long = "header", value_parser = parse_pair)]
        headers: Vec<(String, String)>,
    },
    /// Fetch an image into the disk cache
    Image {
        namespace: String,
        base_url: String,
        path: String,
        /// Path tried if the primary fetch fails
        #[arg(long)]
        fallback: Option<String>,
    },
    /// Delete expired records in a namespace
    Sweep { namespace: String },
    /// Print disk usage of a namespace
    Stats { namespace: String },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    let mut config = FetchConfig::from_env()?;
    if let Some(dir) = cli.cache_dir {
        config.image_cache_dir = dir;
    }

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?cli.command,
        "Starting media-fetch"
    );

    match cli.command {
        Command::Get { base_url, endpoint, params, headers } => {
            let client = headers
                .into_iter()
                .fold(RemoteClient::builder(base_url).config(&config), |b, (k, v)| b.header(k, v))
                .build()?;

            let opts = params
                .into_iter()
                .fold(RequestOptions::new().no_store(), |o, (k, v)| o.param(k, v));

            match client.get(&endpoint, &opts).await? {
                Payload::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Payload::Text(text) => println!("{text}"),
                Payload::Binary(bytes) => println!("<{} bytes>", bytes.len()),
                Payload::Empty => {}
            }
        }
        Command::Image { namespace, base_url, path, fallback } => {
            let proxy = ImageProxy::builder(namespace, base_url).config(&config).build()?;
            let image = proxy.get_image(&path, fallback.as_deref()).await?;

            println!("{}", serde_json::to_string_pretty(&image.meta)?);
            tracing::info!(
                dir = %proxy.key_dir(&path).display(),
                bytes = image.bytes.len(),
                "Image cached"
            );
        }
        Command::Sweep { namespace } => {
            let removed = ImageProxy::clear_cache(&config.image_cache_dir, &namespace).await?;
            println!("{removed}");
        }
        Command::Stats { namespace } => {
            let stats = ImageProxy::image_stats(&config.image_cache_dir, &namespace).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
