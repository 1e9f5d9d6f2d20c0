//! fswatch - watch directories and log what changes
//!
//! Small front end for the `fswatch_engine` library. Events are logged by a
//! synchronous callback and counted by an async consumer; on Ctrl-C the
//! session is stopped and its statistics are printed as JSON.

use std::{
    path::{PathBuf, absolute},
    time::Duration,
};

use {
    anyhow::{Result, bail},
    clap::Parser,
    serde_json::to_string_pretty,
    tokio::signal::ctrl_c,
    tracing::{info, warn},
    tracing_subscriber::EnvFilter,
};

use fswatch_engine::{
    ErrorReporter, FileWatcher, ResultExt, WatchConfig, config::get_config_path,
};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Watch directories for file system changes.
#[derive(Debug, Parser)]
#[command(name = "fswatch", version, about)]
struct Cli {
    /// Directories to watch. Overrides the paths of the config file.
    paths: Vec<PathBuf>,

    /// JSON config file. Defaults to the XDG config location if it exists.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Try the privileged kernel-level backend first.
    #[arg(long)]
    privileged: bool,

    /// Debounce window in seconds.
    #[arg(long, value_name = "SECONDS")]
    throttle: Option<f64>,

    /// Polling cadence in seconds, used when polling is the selected backend.
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<f64>,

    /// Only watch the top level of each directory.
    #[arg(long)]
    no_recursive: bool,

    /// Capacity of the async event queue.
    #[arg(long, value_name = "EVENTS")]
    queue_capacity: Option<usize>,
}

impl Cli {
    /// Loads the base configuration and applies command-line overrides.
    fn into_config(self) -> Result<WatchConfig> {
        let mut config = match self.config {
            Some(path) => WatchConfig::load(&path)
                .add_contextf(format!("loading config {}", path.display()))?,
            None => {
                let default_path = get_config_path();
                if default_path.exists() {
                    WatchConfig::load(&default_path).add_context("loading default config")?
                } else {
                    WatchConfig::default()
                }
            }
        };

        if !self.paths.is_empty() {
            config.paths = self
                .paths
                .iter()
                .map(absolute)
                .collect::<Result<_, _>>()
                .add_context("resolving watch paths")?;
        }
        if config.paths.is_empty() {
            bail!("no directories to watch; pass paths or set them in the config file");
        }
        if self.privileged {
            config.enable_privileged_backend = true;
        }
        if let Some(throttle) = self.throttle {
            config.throttle_window_seconds = throttle;
        }
        if let Some(interval) = self.poll_interval {
            config.poll_interval_seconds = interval;
        }
        if self.no_recursive {
            config.recursive = false;
        }
        if let Some(capacity) = self.queue_capacity {
            config.async_queue_capacity = capacity;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        ErrorReporter::error(&e, "fswatch");
        eprintln!("fswatch: {}", ErrorReporter::to_user_message(&e));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config()?;
    let watcher = FileWatcher::new();

    watcher.register_callback(|event| {
        info!(
            kind = %event.kind(),
            path = ?event.path(),
            backend = %event.backend(),
            "Change"
        );
        Ok(())
    });

    let source = watcher.enable_async(config.async_queue_capacity);
    let consumer = tokio::spawn(async move {
        let mut received = 0u64;
        while source.recv().await.is_some() {
            received += 1;
        }
        received
    });

    watcher.start(config).add_context("starting watch session")?;
    info!("Watching; press Ctrl-C to stop");

    ctrl_c().await.add_context("waiting for Ctrl-C")?;

    if let Err(e) = watcher.stop(STOP_TIMEOUT) {
        warn!("{}", e);
    }
    match consumer.await {
        Ok(received) => info!("Async consumer received {} events", received),
        Err(e) => warn!("Async consumer failed: {}", e),
    }

    let statistics = to_string_pretty(&watcher.get_statistics())
        .add_context("serializing statistics")?;
    println!("{statistics}");
    Ok(())
}
