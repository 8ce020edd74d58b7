pub mod backoff;
pub mod node;
pub mod transport;

use std::{collections::HashMap, sync::Arc};

use tokio::net::TcpListener;

pub use node::Node;

use crate::{
    common::{
        config::Config,
        error::{NetworkError, NodeError},
    },
    consensus::store::LogStore,
};

/*
    Network communication is point-to-point and reliable while a
    connection lasts. Each node listens on its own port for both clients
    and peers, and dials every peer once at startup. A peer that cannot be
    reached within the back-off budget fails startup; later outages only
    cost the messages sent while the peer is down.
*/

/// Brings a node up on an already bound listener: restores state, starts
/// serving, then dials every peer.
pub async fn start(config: &Config, store: Arc<dyn LogStore>, listener: TcpListener) -> Result<Arc<Node>, NodeError> {
    let (node, outbound) = Node::bootstrap(config, store)?;
    let topology = node.processor.topology.clone();

    let server = node.clone();
    tokio::spawn(async move {
        let id = server.id;
        if let Err(err) = transport::serve(listener, server).await {
            tracing::error!(node = id, error = %err, "listener stopped");
        }
    });

    tracing::debug!(node = node.id, peers = ?topology.peers(), "establishing peer connections");
    let mut links = HashMap::new();
    for peer in topology.peers() {
        let addr = topology.addr(peer).ok_or(NetworkError::UnknownPeer(peer))?;
        let stream = transport::dial(peer, &addr, &config.backoff).await?;
        let (link_tx, link_rx) = tokio::sync::mpsc::channel(100);
        transport::spawn_peer_link(node.id, peer, addr, config.backoff.clone(), stream, link_rx);
        links.insert(peer, link_tx);
    }
    transport::spawn_dispatcher(node.id, outbound, links);

    tracing::info!(node = node.id, addr = %topology.listen_addr(), "node started");
    Ok(node)
}

/// Binds the configured port and serves until Ctrl-C.
pub async fn run(config: Config, store: Arc<dyn LogStore>) -> Result<(), NodeError> {
    let addr = config.topology()?.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| NetworkError::Bind { addr: addr.clone(), source })?;

    let node = start(&config, store, listener).await?;
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!(node = node.id, "shutting down"),
        Err(err) => tracing::error!(node = node.id, error = %err, "failed to wait for shutdown signal"),
    }
    Ok(())
}
