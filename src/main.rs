use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use hashsync::{Config, FrameCodec, Monitor, SyncClient, SyncServer};

/// Push new files, pull missing files
#[derive(Parser)]
#[command(name = "hashsync")]
#[command(version)]
#[command(about = "Content-addressed directory sync over TCP")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "HASHSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Shared secret keying the frame cipher
    #[arg(long, global = true, env = "HASHSYNC_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a root directory to clients
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,
        /// Directory to store files under
        #[arg(long)]
        root: Option<PathBuf>,
        /// Connections served concurrently
        #[arg(long)]
        max_connections: Option<usize>,
    },

    /// Keep a local directory synchronized with a server
    Watch {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Seconds between polls
        #[arg(long)]
        interval: Option<u64>,
        /// Concurrent uploads
        #[arg(long)]
        workers: Option<usize>,
        /// Push files already present at startup
        #[arg(long)]
        push_existing: bool,
    },

    /// Push files under the local root once
    Push {
        #[command(flatten)]
        remote: RemoteArgs,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run one pull-sync cycle
    Pull {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create directories on the server
    Mkdirs {
        #[command(flatten)]
        remote: RemoteArgs,
        #[arg(required = true)]
        dirs: Vec<String>,
    },
}

#[derive(clap::Args)]
struct RemoteArgs {
    /// Server address, host:port
    #[arg(long)]
    server: Option<String>,
    /// Local sync root
    #[arg(long)]
    root: Option<PathBuf>,
}

impl RemoteArgs {
    fn apply(self, config: &mut Config) {
        if let Some(server) = self.server {
            config.client.server = server;
        }
        if let Some(root) = self.root {
            config.client.root = Some(root);
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "hashsync=debug,info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn client_for(config: &Config) -> Result<SyncClient> {
    let codec = FrameCodec::new(config.key()?);
    Ok(SyncClient::new(config.client_config()?, codec))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(secret) = cli.secret {
        config.secret = Some(secret);
    }

    match cli.command {
        Commands::Serve {
            bind,
            root,
            max_connections,
        } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(root) = root {
                config.server.root = Some(root);
            }
            if let Some(max) = max_connections {
                config.server.max_connections = max;
            }

            let server = SyncServer::new(config.server_config()?, FrameCodec::new(config.key()?))?;
            let listener = TcpListener::bind(&config.server.bind)
                .await
                .with_context(|| format!("Failed to bind {}", config.server.bind))?;

            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            Arc::new(server).serve_until(listener, shutdown).await?;
        }

        Commands::Watch {
            remote,
            interval,
            workers,
            push_existing,
        } => {
            remote.apply(&mut config);
            if let Some(secs) = interval {
                config.client.poll_interval_secs = secs;
            }
            if let Some(workers) = workers {
                config.client.workers = workers;
            }
            config.client.push_existing |= push_existing;

            let client = Arc::new(client_for(&config)?);
            let mut monitor = Monitor::new(config.monitor_config(), client).await?;
            monitor
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
        }

        Commands::Push { remote, files } => {
            remote.apply(&mut config);
            let client = client_for(&config)?;
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            for file in files {
                let file = cwd.join(file);
                let pushed = client
                    .push_file(&file)
                    .await
                    .with_context(|| format!("Failed to push {}", file.display()))?;
                println!("{}", pushed.display());
            }
        }

        Commands::Pull { remote, json } => {
            remote.apply(&mut config);
            let report = client_for(&config)?.pull_sync().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for saved in &report.saved {
                    println!("{}", saved.relative_path);
                }
                eprintln!(
                    "{} announced, {} needed, {} pulled, {} failed",
                    report.announced,
                    report.needed,
                    report.saved.len(),
                    report.failed
                );
            }
        }

        Commands::Mkdirs { remote, dirs } => {
            remote.apply(&mut config);
            // Directory creation never touches the local root
            config.client.root.get_or_insert_with(|| PathBuf::from("."));
            client_for(&config)?.make_directories(dirs).await?;
        }
    }

    Ok(())
}
