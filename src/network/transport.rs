use std::{collections::HashMap, io, sync::Arc};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc::{Receiver, Sender},
    task::JoinHandle,
};

use super::{backoff::Backoff, node::Node};
use crate::{
    common::{config::BackoffConfig, error::NetworkError},
    consensus::{
        message::{Message, NodeId},
        processor::Outbound,
    },
};

/*
    Newline-delimited JSON over TCP. Peers talk over the connections they
    dial; a node never writes consensus traffic back on an accepted
    connection, only client replies.
*/

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

pub fn decode(line: &str) -> Result<Message, serde_json::Error> {
    serde_json::from_str(line)
}

/// Dials `addr`, retrying with bounded exponential back-off.
pub async fn dial(peer: NodeId, addr: &str, config: &BackoffConfig) -> Result<TcpStream, NetworkError> {
    let mut backoff = Backoff::new(config);
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tracing::debug!(peer, addr, "connection established with peer");
                return Ok(stream);
            }
            Err(source) => {
                tracing::debug!(peer, addr, error = %source, "error connecting to peer");
                match backoff.next_delay() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => {
                        return Err(NetworkError::PeerUnreachable {
                            peer,
                            attempts: backoff.attempts(),
                            source,
                        })
                    }
                }
            }
        }
    }
}

/// Accepts connections forever, one task per connection.
pub async fn serve(listener: TcpListener, node: Arc<Node>) -> Result<(), NetworkError> {
    loop {
        let (stream, remote) = listener.accept().await?;
        tracing::debug!(node = node.id, %remote, "connection accepted");
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, node.clone()).await {
                tracing::debug!(node = node.id, %remote, error = %err, "connection closed");
            }
        });
    }
}

/// Decodes messages off one connection and routes them. Malformed lines are
/// dropped without closing the connection.
pub async fn handle_connection(stream: TcpStream, node: Arc<Node>) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match decode(&line) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(node = node.id, error = %err, "dropping malformed message");
                continue;
            }
        };
        tracing::debug!(node = node.id, kind = message.kind(), "request received");
        if let Some(reply) = node.route(message).await {
            write_message(&mut writer, &reply).await?;
        }
    }
    Ok(())
}

/// Owns the dialed connection to one peer and writes queued messages to it,
/// redialing after a failed write.
pub fn spawn_peer_link(
    node: NodeId,
    peer: NodeId,
    addr: String,
    backoff: BackoffConfig,
    stream: TcpStream,
    mut rx: Receiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = Some(stream);
        while let Some(message) = rx.recv().await {
            if stream.is_none() {
                match dial(peer, &addr, &backoff).await {
                    Ok(reconnected) => stream = Some(reconnected),
                    Err(err) => {
                        tracing::warn!(node, peer, kind = message.kind(), error = %err, "peer unreachable, message dropped");
                        continue;
                    }
                }
            }
            if let Some(conn) = stream.as_mut() {
                if let Err(err) = write_message(conn, &message).await {
                    tracing::warn!(node, peer, kind = message.kind(), error = %err, "write to peer failed");
                    stream = None;
                }
            }
        }
    })
}

/// Fans the node's outbound queue out to the per-peer links.
pub fn spawn_dispatcher(
    node: NodeId,
    mut outbound: Receiver<Outbound>,
    links: HashMap<NodeId, Sender<Message>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Outbound { to, message }) = outbound.recv().await {
            match links.get(&to) {
                Some(link) => {
                    if link.send(message).await.is_err() {
                        tracing::warn!(node, peer = to, "peer link closed");
                    }
                }
                None => tracing::warn!(node, peer = to, "no link to peer"),
            }
        }
    })
}
