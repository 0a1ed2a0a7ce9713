//! Demo binary: runs a small in-process mesh, pairs the nodes manually,
//! exchanges chat, and prints mesh events until interrupted.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft::node::{MeshNode, NodeConfig, NodeEvent};
use weft::reconnect::StaticProbe;
use weft::storage::MemoryStorage;
use weft::swarm::MemorySwarm;
use weft::transport::MemoryConnector;

#[derive(Parser, Debug)]
#[command(name = "weft", about = "In-process mesh chat demo")]
struct Args {
    /// Number of simulated peers.
    #[arg(long, default_value_t = 3)]
    peers: usize,

    /// Pairing passphrase shared by all simulated peers.
    #[arg(long, default_value = "demo-passphrase")]
    passphrase: String,

    /// Chat line the first peer broadcasts after pairing.
    #[arg(long, default_value = "hello mesh")]
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.peers >= 2, "need at least two peers for a mesh");

    // One shared in-memory world: transport hub, swarm, a storage per node.
    let connector = Arc::new(MemoryConnector::new());
    let swarm = Arc::new(MemorySwarm::new());
    let probe = Arc::new(StaticProbe::new("198.51.100.1"));

    let mut nodes = Vec::with_capacity(args.peers);
    for i in 0..args.peers {
        let node = MeshNode::new(
            NodeConfig::new(&format!("peer-{}", i + 1), &args.passphrase),
            connector.clone(),
            swarm.clone(),
            Arc::new(MemoryStorage::new()),
            probe.clone(),
        )
        .await
        .with_context(|| format!("assembling peer {}", i + 1))?;
        node.start().await?;
        nodes.push(node);
    }

    // Manually pair every node with the first one; the mesh routes the rest.
    for follower in nodes.iter().skip(1) {
        let (offer, pending) = nodes[0].begin_pairing().await?;
        let answer = follower.accept_pairing(offer).await?;
        pending.complete(answer).await?;
    }

    // Print every node's events.
    for node in &nodes {
        let name = node.display_name().to_string();
        if let Some(mut events) = node.take_events().await {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        NodeEvent::PeerConnected { peer_id, display_name } => {
                            info!(node = %name, peer = %peer_id, %display_name, "peer connected")
                        }
                        NodeEvent::PeerDisconnected { peer_id } => {
                            info!(node = %name, peer = %peer_id, "peer disconnected")
                        }
                        NodeEvent::Chat { from_name, text, .. } => {
                            info!(node = %name, from = %from_name, %text, "chat")
                        }
                        NodeEvent::NameChanged { peer_id, new_name } => {
                            info!(node = %name, peer = %peer_id, %new_name, "name changed")
                        }
                        NodeEvent::AnnouncementVerified { announcement } => {
                            info!(node = %name, peer = %announcement.peer_id,
                                sequence = announcement.sequence, "announcement verified")
                        }
                        NodeEvent::KeyMismatch { peer_id } => {
                            info!(node = %name, peer = %peer_id, "key mismatch rejected")
                        }
                    }
                }
            });
        }
    }

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let reached = nodes[0].send_chat(&args.message).await?;
    info!(reached, "chat broadcast sent");

    info!("mesh running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
