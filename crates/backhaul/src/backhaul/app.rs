use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::Mutex, task::JoinSet};

use crate::backhaul::config::{self, Config, Mode, WebConfig};
use crate::backhaul::tunnel::{
    agent::{Agent, AgentOptions},
    relay::{Relay, RelayOptions},
    status::StatusProvider,
};
use crate::backhaul::{admin, logging, telemetry};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    let prom = telemetry::init_prometheus()?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        mode = %cfg.mode,
        web_port = cfg.web.port,
        "backhaul: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    let provider: Arc<dyn StatusProvider> = match cfg.mode {
        Mode::Server => {
            let relay = Arc::new(Relay::new(relay_options(&cfg)));
            let shutdown = shutdown_rx.clone();
            tasks.spawn(relay.clone().listen_and_serve(shutdown));
            relay
        }
        Mode::Client => {
            let agent = Arc::new(Agent::new(agent_options(&cfg)));
            let shutdown = shutdown_rx.clone();
            let runner = agent.clone();
            tasks.spawn(async move { runner.run(shutdown).await });
            agent
        }
    };

    if cfg.web.port != 0 {
        let addr = dashboard_addr(&cfg.web);
        if addr.ip().is_loopback() {
            tracing::warn!(admin_addr = %addr, "admin: no web credentials configured; serving on loopback only");
        }
        let state = admin::AdminState {
            provider,
            prom,
            config: Arc::new(Mutex::new(cfg.clone())),
            config_path: Some(resolved.path.clone()),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
            }
        }
    }

    // Hard cap so a stuck bridge cannot stall exit.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

/// Without credentials the dashboard is unauthenticated, so it only listens locally.
fn dashboard_addr(web: &WebConfig) -> SocketAddr {
    if web.username.is_empty() && web.password.is_empty() {
        SocketAddr::from(([127, 0, 0, 1], web.port))
    } else {
        SocketAddr::from(([0, 0, 0, 0], web.port))
    }
}

fn relay_options(cfg: &Config) -> RelayOptions {
    RelayOptions {
        control_addr: format!(":{}", cfg.server.control_port),
        auth_token: cfg.server.token.clone(),
        port_range: cfg.server.port_range,
        bind_host: cfg.server.bind_host.clone(),
        pending_timeout: cfg.timeouts.pending,
        handshake_timeout: cfg.timeouts.handshake,
    }
}

fn agent_options(cfg: &Config) -> AgentOptions {
    AgentOptions {
        server_addr: cfg.client.server_addr.clone(),
        auth_token: cfg.client.token.clone(),
        tunnels: cfg.client.tunnels.clone(),
        dial_timeout: cfg.timeouts.dial,
        heartbeat_interval: cfg.timeouts.heartbeat,
        retry_backoff: cfg.timeouts.retry_backoff,
        response_timeout: cfg.timeouts.response,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
