//! EcoWatt Server -- telemetry ingest and FOTA delivery for EcoWatt devices.
//!
//! Usage:
//!   ecowatt-server                              # Run with default config
//!   ecowatt-server --config path.toml           # Run with custom config
//!   ecowatt-server pack build/ecowatt.bin --version 1.0.4
//!   ecowatt-server progress EcoWatt-01          # Query a running server

use ecowatt_server::config::ServerConfig;
use ecowatt_server::{build_state, expand_tilde, serve};

use clap::{Parser, Subcommand};
use ecowatt_fota::{ArtifactSource, FsArtifactSource};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ecowatt-server", about = "EcoWatt telemetry ingest and FOTA server")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.ecowatt/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Run,
    /// Stage a firmware image for FOTA delivery
    Pack {
        /// Firmware binary
        bin: PathBuf,
        /// Chunk size in bytes (defaults to fota.chunk_size)
        #[arg(long)]
        chunk_size: Option<u32>,
        /// Version string advertised in the manifest
        #[arg(long, default_value = "1.0.0")]
        version: String,
    },
    /// Queue a one-shot config update for the next upload
    QueueConfig {
        /// JSON object
        json: String,
    },
    /// Queue a one-shot command for the next upload
    QueueCommand {
        /// JSON object
        json: String,
    },
    /// Show FOTA progress (queries the running server)
    Progress {
        device: Option<String>,
    },
    /// Show FOTA events (queries the running server)
    Events {
        device: Option<String>,
    },
    /// Print a random token for use as PSK or auth token
    Keygen {
        #[arg(long, default_value_t = 48)]
        len: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ecowatt_server=info,ecowatt_api=info,ecowatt_fota=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let mut cfg = ServerConfig::load_or_default(&config_path)?;
    cfg.apply_env()?;

    match cli.command {
        Some(Commands::Run) | None => {
            run_server(cfg).await?;
        }
        Some(Commands::Pack {
            bin,
            chunk_size,
            version,
        }) => {
            let image = std::fs::read(&bin)?;
            let source = open_artifacts(&cfg)?;
            let chunk_size = chunk_size.unwrap_or(cfg.fota.chunk_size);
            let manifest = source.stage_firmware(&image, &version, chunk_size)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
            println!(
                "{} chunks staged in {}",
                manifest.total_chunks(),
                source.dir().display()
            );
        }
        Some(Commands::QueueConfig { json }) => {
            let value = parse_object(&json)?;
            open_artifacts(&cfg)?.queue_config(&value)?;
            println!("config update queued");
        }
        Some(Commands::QueueCommand { json }) => {
            let value = parse_object(&json)?;
            open_artifacts(&cfg)?.queue_command(&value)?;
            println!("command queued");
        }
        Some(Commands::Progress { device }) => {
            let path = match device {
                Some(d) => format!("/api/fota/progress/{d}"),
                None => "/api/fota/progress".to_string(),
            };
            cli_api_call(&cfg, &path).await?;
        }
        Some(Commands::Events { device }) => {
            let path = match device {
                Some(d) => format!("/api/fota/events/{d}"),
                None => "/api/fota/events".to_string(),
            };
            cli_api_call(&cfg, &path).await?;
        }
        Some(Commands::Keygen { len }) => {
            println!("{}", ecowatt_crypto::generate_token(len));
        }
    }

    Ok(())
}

fn open_artifacts(cfg: &ServerConfig) -> anyhow::Result<FsArtifactSource> {
    Ok(FsArtifactSource::open(&expand_tilde(&cfg.server.artifact_dir))?)
}

fn parse_object(json: &str) -> anyhow::Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    if !value.is_object() {
        anyhow::bail!("expected a JSON object");
    }
    Ok(value)
}

/// GET a path on the running server and print the JSON response.
async fn cli_api_call(cfg: &ServerConfig, path: &str) -> anyhow::Result<()> {
    let addr = cfg.server.listen_addr.replace("0.0.0.0", "127.0.0.1");
    let url = format!("http://{}{}", addr, path);

    let client = reqwest::Client::new();
    let mut req = client.get(&url);
    if let Some(token) = cfg.auth.tokens.first() {
        req = req.header("Authorization", format!("Bearer {}", token));
    }
    let resp = req.send().await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_server(cfg: ServerConfig) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = %cfg.server.transport,
        payload_mode = %cfg.envelope.payload_mode,
        auth = !cfg.auth.tokens.is_empty(),
        reject_stale_nonce = cfg.envelope.reject_stale_nonce,
        "starting ecowatt-server"
    );

    let state = build_state(&cfg)?;
    let router = ecowatt_api::router(state);

    // Shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let api_handle = match cfg.server.transport.as_str() {
        "http" => {
            let listener = tokio::net::TcpListener::bind(&cfg.server.listen_addr).await?;
            tracing::info!(addr = %cfg.server.listen_addr, "listening (HTTP)");
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = serve::serve_http(listener, router, shutdown).await {
                    tracing::error!("server error: {e}");
                }
            })
        }
        "unix" => {
            let sock_path = expand_tilde(&cfg.server.socket);
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = serve::serve_unix(&sock_path, router, shutdown).await {
                    tracing::error!("server error: {e}");
                }
            })
        }
        other => {
            anyhow::bail!("unsupported transport: {other}");
        }
    };

    tracing::info!("press Ctrl-C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    let _ = shutdown_tx.send(());

    let _ = api_handle.await;

    tracing::info!("shutdown complete");
    Ok(())
}
