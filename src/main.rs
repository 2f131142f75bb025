//! Agent core bootstrap: load configuration, wire the hub client, probe
//! server, and rapp session together, and shut down cleanly on
//! `SIGINT`/`SIGTERM`.

use agentcore::config::Config;
use agentcore::hub_client::HubClient;
use agentcore::state::SharedState;
use agentcore::{probe_server, rapp};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.log_colorized)
        .init();
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup failed: {e}");
            std::process::exit(1);
        }
    };
    init_logging(&config);

    info!(version = VERSION, "starting agentcore");

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!(error = %e, dir = %config.data_dir.display(), "failed to create data directory");
        std::process::exit(1);
    }

    let agentcore_json_path = config.agentcore_json_path();
    if !agentcore_json_path.exists() {
        info!("agentcore JSON file not found; creating a new one");
        if let Err(e) = std::fs::write(&agentcore_json_path, b"null") {
            error!(error = %e, "failed to create agentcore JSON file");
            std::process::exit(1);
        }
    }
    let persisted_id = HubClient::read_persisted_id(&agentcore_json_path);

    let config = Arc::new(config);
    let state = Arc::new(SharedState::new(
        config.name.clone(),
        config.zone,
        config.token.clone(),
        config.assets_path(),
    ));
    if let Some(id) = persisted_id {
        state.set_agentcore_id(id).await;
    }

    let hub = HubClient::new(config.clone(), state.clone(), VERSION.to_string());
    state.set_hub(hub.clone()).await;
    hub.load_queue().await;
    let (reconnect_task, drain_task) = hub.clone().start();

    let probe_state = state.clone();
    let probe_port = config.probe_server_port;
    let probe_task = tokio::spawn(async move {
        if let Err(e) = probe_server::run(probe_state, probe_port).await {
            error!(error = %e, "probe server stopped");
        }
    });

    let rapp_state = state.clone();
    let rapp_port = config.rapp_port;
    let rapp_task = tokio::spawn(async move {
        if let Err(e) = rapp::run(rapp_state, rapp_port).await {
            error!(error = %e, "rapp server stopped");
        }
    });

    wait_for_shutdown_signal().await;
    info!("signal received, stop agentcore");

    reconnect_task.abort();
    drain_task.abort();
    probe_task.abort();
    rapp_task.abort();

    hub.shutdown().await;
    state.dump_probe_assets().await;

    info!("bye!");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
