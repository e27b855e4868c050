use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use llm_gateway::config::GatewayConfig;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

fn spawn_metrics_server(listener: TcpListener, handle: PrometheusHandle) {
    let upkeep = handle.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            upkeep.run_upkeep();
        }
    });

    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "metrics server stopped");
        }
    });
}

async fn run(cfg: GatewayConfig) -> anyhow::Result<()> {
    for backend in &cfg.backends {
        tracing::info!(%backend, "configured backend");
    }

    let grace = cfg.shutdown_grace;
    let metrics_addr = cfg.metrics_addr;
    let listen = (cfg.host.clone(), cfg.port);
    let state = llm_gateway::AppState::new(cfg)?;
    let app = llm_gateway::app(state);

    if let Some(addr) = metrics_addr {
        let handle = llm_gateway::telemetry::install_prometheus()
            .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "metrics listening");
        spawn_metrics_server(listener, handle);
    }

    let listener = TcpListener::bind((listen.0.as_str(), listen.1)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(listen = %local_addr, "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut server = std::pin::pin!(server.into_future());
    tokio::select! {
        res = &mut server => res?,
        _ = async {
            let _ = shutdown_rx.await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(grace_secs = grace.as_secs(), "in-flight requests did not drain in time");
        }
    }

    tracing::info!("server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = match GatewayConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing("info");
            tracing::error!(error = %err, "invalid configuration");
            return Err(err.into());
        }
    };
    init_tracing(&cfg.log_level);

    if let Err(err) = cfg.validate() {
        tracing::error!(error = %err, "invalid configuration");
        return Err(err.into());
    }

    run(cfg).await
}
