#![allow(dead_code, unused_imports, unused_variables)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use odin_websocket_hub::config::Config;
use odin_websocket_hub::hub::Hub;
use odin_websocket_hub::{http, upstream, ws};

#[tokio::main]
async fn main() {
    // Config errors are one of the few allowed to reach the process
    // boundary (section 7's error taxonomy: "config invalid ... exit
    // non-zero after best-effort log"). `tracing` isn't initialized yet,
    // so a bad environment is logged to stderr directly.
    let config = Config::try_load().unwrap_or_else(|err| {
        eprintln!("fatal: invalid configuration: {err}");
        std::process::exit(1);
    });
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.server.log_level)),
        )
        .init();

    tracing::info!(
        target: "hub",
        shard_count = config.registry.shard_count,
        max_connections = config.registry.max_connections,
        broadcast_workers = config.broadcast.broadcast_workers,
        "odin websocket hub starting"
    );

    let hub = Hub::new(config.clone());

    let upstream_config = config.upstream.clone();
    let upstream_token = hub.cancellation_token();
    let upstream_hub = hub.clone();
    tokio::spawn(async move {
        upstream::run_subscription(
            upstream_hub,
            upstream::NoopUpstream,
            "prices".to_string(),
            upstream_config,
            upstream_token,
        )
        .await;
    });

    let ws_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.ws_port)
        .parse()
        .expect("invalid SERVER_HOST/SERVER_PORT");
    let http_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.http_port)
        .parse()
        .expect("invalid SERVER_HOST/HTTP_PORT");

    let ws_listener = TcpListener::bind(ws_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind websocket listener on {ws_addr}: {e}"));
    let http_listener = TcpListener::bind(http_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind http side-car listener on {http_addr}: {e}"));

    tracing::info!(target: "hub", %ws_addr, %http_addr, "listening");

    let ws_router = ws::router(hub.clone(), &config.server.ws_path);
    let http_router = http::router(hub.clone());

    let shutdown_signal = hub.cancellation_token();
    let ws_shutdown = shutdown_signal.clone();
    let http_shutdown = shutdown_signal.clone();

    let ws_server = tokio::spawn(async move {
        axum::serve(
            ws_listener,
            ws_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { ws_shutdown.cancelled().await })
        .await
        .ok();
    });
    let http_server = tokio::spawn(async move {
        axum::serve(http_listener, http_router)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
            .ok();
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!(target: "hub", "shutdown signal received");

    hub.shutdown(Duration::from_millis(config.server.shutdown_deadline_ms))
        .await;
    let _ = ws_server.await;
    let _ = http_server.await;
}
