use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use keyrelay_common::GatewayConfig;
use keyrelay_core::{
    DefaultGatekeeper, Gateway, TracingUsageSink, UpstreamClientConfig, WreqUpstreamClient,
};
use keyrelay_router::app_router;
use tracing::info;

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("keyrelay failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    config.apply(cli.patch());
    config.validate().context("invalid configuration")?;
    info!(
        host = %config.host,
        port = config.port,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        concurrency_limit = config.queue.concurrency_limit,
        check_keys = config.checks.enabled,
        "config loaded"
    );

    let upstream = WreqUpstreamClient::new(UpstreamClientConfig::from_config(
        &config.upstream,
        config.proxy.clone(),
    ))
    .context("building upstream http client")?;
    let gateway = Gateway::launch(
        &config,
        Arc::new(upstream),
        Arc::new(DefaultGatekeeper),
        Arc::new(TracingUsageSink),
    )
    .await
    .context("building key pool")?;
    let gateway = Arc::new(gateway);

    let app = app_router(gateway.clone());
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    gateway.shutdown();
    info!("stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keyrelay=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
