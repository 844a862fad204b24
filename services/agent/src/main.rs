// capydeploy-agent: accepts Hub connections over the control channel,
// advertises itself over mDNS, and streams telemetry and logs back.

use agent::config;
use agent::discovery::MdnsAdvertiser;
use agent::server::{AgentServer, AgentState};
use agent::settings::Settings;
use agent::steam;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "capydeploy-agent", version)]
struct Args {
    /// Config file path (default: /etc/capydeploy/agent.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "agent starting");

    let cfg = {
        let result = match &args.config {
            Some(path) => config::load_config_from_path(path),
            None => config::load_config(),
        };
        match result {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        }
    };

    let sqlite_path = PathBuf::from(&cfg.storage.sqlite_path);
    if let Some(parent) = sqlite_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("FATAL: cannot create data dir {}: {}", parent.display(), e);
            std::process::exit(1);
        }
    }
    let settings = match Settings::open(&sqlite_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to open settings store: {}", e);
            std::process::exit(1);
        }
    };

    let state = AgentState::new(cfg, settings).await;

    // Stale frontend events from a previous run are meaningless now.
    state.bridge.sweep_stale().await;

    let install_root = steam::expand_path(&state.install_path().await);
    if let Err(e) = std::fs::create_dir_all(&install_root) {
        warn!(path = %install_root.display(), error = %e, "cannot create install root");
    }

    let server = match AgentServer::bind(state.clone()).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("FATAL: failed to bind control channel: {}", e);
            std::process::exit(1);
        }
    };
    let port = server.port();

    let advertiser = if state.config.discovery.enabled {
        match MdnsAdvertiser::register(
            &state.agent_id,
            &state.agent_name().await,
            &state.platform,
            &state.version,
            port,
        ) {
            Ok(a) => Some(a),
            Err(e) => {
                error!(error = %e, "mDNS registration failed; running without discovery");
                None
            }
        }
    } else {
        None
    };

    info!(
        agent_id = %state.agent_id,
        port,
        platform = %state.platform,
        "agent ready"
    );

    tokio::select! {
        () = server.run() => error!("control channel listener exited"),
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    state.close_connection().await;
    if let Some(advertiser) = advertiser {
        advertiser.shutdown();
    }
    info!("agent stopped");
}
