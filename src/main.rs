//! Reparto daemon entry point.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use reparto::agent::{Agent, AgentSettings};
use reparto::channel::TcpConnector;
use reparto::config::{Config, Mode};
use reparto::coordinator::Coordinator;
use reparto::discovery::{DatagramClient, DatagramServer};
use reparto::runtime::{FileConfigStore, GitCodebase, UpstartSupervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting reparto {:?} with config: {:?}", cfg.mode, cfg);

    let handles = match cfg.mode {
        Mode::Coordinator => start_coordinator(&cfg).await?,
        Mode::Agent => start_agent(&cfg).await?,
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    for handle in handles {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn start_coordinator(cfg: &Config) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let coordinator = Coordinator::new(
        Arc::new(GitCodebase::new(cfg.git_dir.clone(), cfg.branch.clone())),
        Arc::new(FileConfigStore::new(cfg.config_dir.clone())),
        Arc::new(TcpConnector),
        cfg.reconnect_delay(),
        cfg.challenge_ttl(),
    );

    // Discovery listener
    let server = DatagramServer::bind(cfg.datagram_server_port, cfg.multicast_address).await?;
    let (discovery_tx, discovery_rx) = mpsc::channel(128);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(discovery_tx).await {
            error!("Discovery listener failed: {}", e);
        }
    });
    let membership_handle = tokio::spawn(Arc::clone(&coordinator).run_discovery(discovery_rx));

    // Bundle transfers
    let listener =
        TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.transfer_port))).await?;
    let transfer_handle = tokio::spawn(async move {
        if let Err(e) = coordinator.serve_transfers(listener).await {
            error!("Transfer listener failed: {}", e);
        }
    });

    Ok(vec![server_handle, membership_handle, transfer_handle])
}

async fn start_agent(cfg: &Config) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let announcer = DatagramClient::bind(
        cfg.datagram_client_port,
        cfg.multicast_address,
        cfg.datagram_server_port,
    )
    .await?;
    let settings = AgentSettings {
        tcp_port: cfg.tcp_port,
        transfer_port: cfg.transfer_port,
        environment: cfg.environment.clone(),
        roles: cfg.roles.clone(),
        discovery_interval: cfg.discovery_interval(),
        version_report_interval: cfg.version_report_interval(),
    };
    let agent = Agent::new(
        settings,
        Arc::new(announcer),
        Arc::new(UpstartSupervisor::new(cfg.apps_dir.clone())),
        Arc::new(TcpConnector),
    );

    let listener =
        TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.tcp_port))).await?;
    let agent_handle = tokio::spawn(async move {
        if let Err(e) = agent.run(listener).await {
            error!("Agent failed: {}", e);
        }
    });

    Ok(vec![agent_handle])
}
