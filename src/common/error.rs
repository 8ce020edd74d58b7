use std::{io, path::PathBuf};

use thiserror::Error;

use crate::consensus::message::{Ballot, NodeId};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("node {0} is not part of the topology")]
    UnknownNode(NodeId),
    #[error("topology must have exactly {expected} nodes, found {found}")]
    ClusterSize { expected: usize, found: usize },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("log store io error: {0}")]
    Io(#[from] io::Error),
    #[error("log store codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("stored chain of node {node} has a gap at sequence {seq}")]
    Gap { node: NodeId, seq: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Accept,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("{phase:?} quorum not reached: {received} of {needed} peer responses")]
    QuorumTimeout {
        phase: Phase,
        received: usize,
        needed: usize,
    },
    #[error("ballot {ballot} superseded by {by}")]
    Superseded { ballot: Ballot, by: Ballot },
    #[error("{phase:?} rejected by too many peers for ballot {ballot}")]
    Rejected { phase: Phase, ballot: Ballot },
    #[error("consensus channel closed")]
    ChannelClosed,
}

impl ConsensusError {
    /// Whether a fresh round with a higher ballot may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ConsensusError::ChannelClosed)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("node serves client {expected}, transfer sent by {found}")]
    WrongClient { expected: u64, found: u64 },
    #[error("transfer amount must be positive")]
    InvalidAmount,
    #[error("transfer amount {amount} exceeds the largest balance {max}")]
    AmountTooLarge { amount: u64, max: i64 },
    #[error("insufficient funds: balance {balance}, amount {amount}")]
    InsufficientFunds { balance: i64, amount: u64 },
    #[error("consensus unavailable after {attempts} rounds: {last}")]
    Unavailable { attempts: u32, last: ConsensusError },
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("peer {peer} unreachable after {attempts} attempts: {source}")]
    PeerUnreachable {
        peer: NodeId,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("no address for peer {0}")]
    UnknownPeer(NodeId),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}
