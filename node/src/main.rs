// Copyright (c) 2026 Tether Contributors. MIT License.
// See LICENSE for details.

//! # Tether Hub
//!
//! Entry point for the `tether-hub` binary.
//!
//! - `run`: start one or more hub instances. With `--instances N` they run
//!   in this process on consecutive ports, bridged over an in-memory bus.
//! - `agent`: connect to a hub as a peer agent.
//! - `version`: print build version information.

mod agent;
mod api;
mod cli;
mod logging;
mod metrics;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;

use tether_protocol::config::{HubConfig, WIRE_PROTOCOL_VERSION};
use tether_protocol::hub::{spawn_maintenance, ClusterBridge, InMemoryPubSub, PubSub, TransportGateway};

use cli::{Commands, TetherCli};
use logging::LogFormat;
use metrics::{HubMetrics, MetricsState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TetherCli::parse();

    match cli.command {
        Commands::Run(args) => run_hub(args).await,
        Commands::Agent(args) => {
            logging::init_logging(
                "tether_hub=info,tether_protocol=info",
                LogFormat::from_str_lossy(&args.log_format),
            );
            agent::run_agent(args).await
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Start every instance, the shared metrics listener and the maintenance
/// loops, then serve until a shutdown signal arrives.
async fn run_hub(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "tether_hub=info,tether_protocol=info,tower_http=debug",
        LogFormat::from_str_lossy(&args.log_format),
    );

    let base = settings::load(args.config.as_deref())?;
    let instances = args.instances.max(1);
    tracing::info!(
        instance_id = %base.instance_id,
        instances,
        port = args.port,
        metrics_port = args.metrics_port,
        "starting tether-hub"
    );

    let metrics = Arc::new(HubMetrics::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Only worth bridging when there is someone to bridge to.
    let bus: Option<Arc<dyn PubSub>> = (instances > 1).then(|| Arc::new(InMemoryPubSub::default()) as Arc<dyn PubSub>);

    let mut servers = JoinSet::new();
    let mut gateways = Vec::with_capacity(usize::from(instances));
    let mut maintenance = Vec::with_capacity(usize::from(instances));

    for index in 0..instances {
        let config = settings::for_instance(&base, index);
        let port = args
            .port
            .checked_add(index)
            .context("instance port out of range")?;
        let gateway = start_instance(config, bus.clone()).await;

        let state = api::AppState {
            version: format!("{} (wire protocol {})", env!("CARGO_PKG_VERSION"), WIRE_PROTOCOL_VERSION),
            gateway: Arc::clone(&gateway),
            metrics: Arc::clone(&metrics),
        };
        let addr = format!("{}:{}", args.bind, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind hub listener on {}", addr))?;
        tracing::info!(instance_id = %gateway.instance_id(), %addr, "hub instance listening");

        let router = api::create_router(state);
        servers.spawn(async move { axum::serve(listener, router).await });
        maintenance.push(spawn_maintenance(Arc::clone(&gateway), shutdown_rx.clone()));
        gateways.push(gateway);
    }

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(MetricsState {
            metrics: Arc::clone(&metrics),
            gateways: gateways.clone(),
        });
    let metrics_addr = format!("{}:{}", args.bind, args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    tokio::select! {
        Some(res) = servers.join_next() => {
            match res {
                Ok(Err(e)) => tracing::error!(error = %e, "hub server error"),
                Err(e) => tracing::error!(error = %e, "hub server task failed"),
                Ok(Ok(())) => {}
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in maintenance {
        let _ = task.await;
    }
    for gateway in &gateways {
        if let Some(bridge) = gateway.bridge() {
            bridge.stop();
        }
    }
    servers.abort_all();
    tracing::info!("tether-hub stopped");
    Ok(())
}

/// Build a gateway and, when a bus is given, bridge it into the cluster.
/// A bridge that fails to start leaves the instance serving its own peers.
async fn start_instance(config: HubConfig, bus: Option<Arc<dyn PubSub>>) -> Arc<TransportGateway> {
    let bridge_config = config.bridge.clone();
    let gateway = Arc::new(TransportGateway::new(config));
    if let Some(bus) = bus {
        let bridge = Arc::new(ClusterBridge::new(gateway.instance_id(), bus, bridge_config));
        gateway.attach_bridge(Arc::clone(&bridge));
        if let Err(e) = bridge.start(&gateway).await {
            tracing::warn!(instance_id = %gateway.instance_id(), error = %e, "cluster bridge failed to start");
        }
    }
    gateway
}

fn print_version() {
    println!("tether-hub {}", env!("CARGO_PKG_VERSION"));
    println!("wire      {}", WIRE_PROTOCOL_VERSION);
    println!("rustc     {}", rustc_version());
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
