mod directory;
mod events;
mod simulate;

use clap::{Parser, Subcommand};
use events::{emit, EventSkewed};
use herd_protocol::{geo, skew_location, RuntimeConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "herd", about = "Anonymous geotagged gossip posts")]
struct Cli {
    /// Max content bytes per wire fragment (default: 400).
    #[arg(long)]
    fragment_size: Option<usize>,

    /// Seconds between catch-up probes (default: 5).
    #[arg(long)]
    catchup_interval: Option<u64>,

    /// Directory servers (comma-separated). Overrides HERD_BOOTSTRAP_SERVERS.
    #[arg(long, value_delimiter = ',')]
    bootstrap: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run N peers on an in-process overlay and report convergence.
    Simulate {
        /// Number of peers.
        #[arg(long, default_value = "3")]
        peers: usize,
        /// Number of posts, authored round-robin.
        #[arg(long, default_value = "10")]
        posts: usize,
        /// Center latitude of the authoring area.
        #[arg(long, default_value = "48.8566", allow_hyphen_values = true)]
        latitude: f64,
        /// Center longitude of the authoring area.
        #[arg(long, default_value = "2.3522", allow_hyphen_values = true)]
        longitude: f64,
        /// Give up waiting for convergence after this many seconds.
        #[arg(long, default_value = "30")]
        duration: u64,
        /// Persist each peer's posts in `<dir>/<peer>.sqlite3`.
        #[arg(long)]
        db_dir: Option<PathBuf>,
        /// Ranked posts to print.
        #[arg(long, default_value = "10")]
        top: usize,
    },

    /// Print skewed positions for a true position.
    Skew {
        #[arg(long, allow_hyphen_values = true)]
        latitude: f64,
        #[arg(long, allow_hyphen_values = true)]
        longitude: f64,
        /// Number of samples.
        #[arg(long, default_value = "1")]
        count: u32,
    },

    /// List the addresses published by the directory servers.
    Directory,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = RuntimeConfig::new();
    if let Some(bytes) = cli.fragment_size {
        config = config.fragment_size(bytes);
    }
    if let Some(secs) = cli.catchup_interval {
        config = config.catchup_interval(Duration::from_secs(secs));
    }
    if !cli.bootstrap.is_empty() {
        config = config.bootstrap_servers(cli.bootstrap);
    }

    eprintln!("herd v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Simulate {
            peers,
            posts,
            latitude,
            longitude,
            duration,
            db_dir,
            top,
        } => {
            // The in-process overlay has nothing to dial.
            let runtime = config.bootstrap_servers(Vec::new());
            simulate::run(simulate::SimulateConfig {
                peers,
                posts,
                latitude,
                longitude,
                duration: Duration::from_secs(duration),
                db_dir,
                top,
                runtime,
            })
            .await?;
        }

        Command::Skew {
            latitude,
            longitude,
            count,
        } => {
            anyhow::ensure!(
                (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude),
                "position out of range: {latitude}, {longitude}"
            );
            for _ in 0..count {
                let moved = skew_location(latitude, longitude, &config.skew);
                emit(&EventSkewed {
                    event: "skewed",
                    latitude: moved.latitude,
                    longitude: moved.longitude,
                    distance_km: geo::distance_m(latitude, longitude, moved.latitude, moved.longitude)
                        / 1000.0,
                });
            }
        }

        Command::Directory => {
            directory::run(&config.bootstrap_servers).await?;
        }
    }

    Ok(())
}
