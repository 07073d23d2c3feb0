use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::UdpSocket, sync::watch, task::JoinSet};

use crate::backhaul::{
    config::{self, LoggingConfig},
    echo, logging,
    tunnel::{
        client::{self, Client, ClientOptions},
        ports::PortAllocator,
        server::{Server, ServerOptions},
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub control_addr: String,
    pub secret: String,
    pub bind_host: IpAddr,
}

pub async fn run_server(logging: LoggingConfig, settings: ServerSettings) -> anyhow::Result<()> {
    let _logrt = logging::init(&logging)?;

    if settings.secret == config::DEFAULT_SECRET {
        tracing::warn!("server: using the default secret; set SECRET_KEY");
    }

    let ports = Arc::new(PortAllocator::new());
    let server = Server::bind(
        ServerOptions {
            control_addr: settings.control_addr,
            secret: settings.secret,
            bind_host: settings.bind_host,
        },
        ports,
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(async move { server.serve(shutdown_rx).await });

    supervise(tasks, shutdown_tx).await
}

pub async fn run_client(logging: LoggingConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_client_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let mut logging = logging;
    if let Some(o) = &cfg.logging {
        logging.apply(o);
    }
    let _logrt = logging::init(&logging)?;

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server = %cfg.server_addr(),
        tunnels = cfg.tunnels.len(),
        "client: starting"
    );
    if cfg.tunnels.is_empty() {
        tracing::warn!("client: no tunnels configured");
    }
    if cfg.uses_default_secret() {
        tracing::warn!("client: using the default secret");
    }
    let client = Client::new(ClientOptions {
        server_addr: cfg.server_addr(),
        secret: cfg.secret,
        tunnels: cfg.tunnels,
        reconnect_delay: client::RECONNECT_DELAY,
    })?;
    for d in client.definitions() {
        tracing::info!(tunnel_id = d.id, proto = %d.protocol, local = d.local, remote = d.remote, "client: tunnel");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(async move { client.run(shutdown_rx).await });

    supervise(tasks, shutdown_tx).await
}

pub async fn run_udp_echo(logging: LoggingConfig, port: u16) -> anyhow::Result<()> {
    let _logrt = logging::init(&logging)?;

    let sock = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("echo: bind udp port {port}"))?;

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(async move { echo::serve(sock).await.context("echo: recv") });

    supervise(tasks, shutdown_tx).await
}

/// Wait for a signal or the first task to end, then flip `shutdown` and drain.
async fn supervise(
    mut tasks: JoinSet<anyhow::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain: exit as soon as tasks finish; the timeout only matters if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = %humantime::format_duration(DRAIN_TIMEOUT), "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn supervise_returns_first_task_error() {
        let (tx, rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tasks.spawn(async { Err::<(), _>(anyhow::anyhow!("boom")) });
        let mut waiter = rx.clone();
        tasks.spawn(async move {
            let _ = waiter.wait_for(|v| *v).await;
            Ok(())
        });

        let err = supervise(tasks, tx).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(*rx.borrow());
    }
}
