use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::message::{AcceptedValue, Ballot, Block, NodeId, Transaction};
use crate::common::error::StoreError;

/*
    Side-channel mirror of each node's durable state: the local log, the
    committed chain, the ballot floor and any accepted-but-undecided block.
    It is rewritten after every change and read once at startup; in-process
    decisions never consult it. Log and chain travel in one snapshot, so a
    settled prefix never disappears from the log without its block.
*/

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub local_log: Vec<Transaction>,
    #[serde(default)]
    pub blockchain: Vec<Block>,
    #[serde(default)]
    pub promised: Option<Ballot>,
    #[serde(default)]
    pub accepted: Option<AcceptedValue>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.local_log.is_empty() && self.blockchain.is_empty() && self.promised.is_none()
    }
}

pub trait LogStore: Send + Sync {
    fn save(&self, node: NodeId, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Empty snapshot when nothing was ever saved for `node`.
    fn load(&self, node: NodeId) -> Result<Snapshot, StoreError>;
}

/// One JSON file per node under `dir`.
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileLogStore { dir })
    }

    fn path(&self, node: NodeId) -> PathBuf {
        self.dir.join(format!("node-{}-state.json", node))
    }
}

impl LogStore for FileLogStore {
    fn save(&self, node: NodeId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(snapshot)?;

        // write then rename so a crash never leaves a torn snapshot
        let temp_path = self.dir.join(format!("node-{}-state.tmp", node));
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.path(node))?;
        Ok(())
    }

    fn load(&self, node: NodeId) -> Result<Snapshot, StoreError> {
        let path = self.path(node);
        if !path.exists() {
            return Ok(Snapshot::default());
        }
        let contents = fs::read(&path)?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

/// Shared in-memory store; clones see the same data, so a node rebuilt from
/// the same store behaves like a restarted process.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    snapshots: Arc<Mutex<HashMap<NodeId, Snapshot>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn save(&self, node: NodeId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshots.insert(node, snapshot.clone());
        Ok(())
    }

    fn load(&self, node: NodeId) -> Result<Snapshot, StoreError> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(snapshots.get(&node).cloned().unwrap_or_default())
    }
}

/// Mirrors every published snapshot to `store` in the background. Only the
/// latest snapshot is written; failures are logged and dropped.
pub fn spawn_persister(
    store: Arc<dyn LogStore>,
    node: NodeId,
    mut snapshots: watch::Receiver<Snapshot>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            let store = store.clone();
            let pending = snapshot.local_log.len();
            let height = snapshot.blockchain.len();
            match tokio::task::spawn_blocking(move || store.save(node, &snapshot)).await {
                Ok(Ok(())) => tracing::trace!(node, pending, height, "state mirrored"),
                Ok(Err(err)) => tracing::warn!(node, error = %err, "failed to mirror state"),
                Err(err) => tracing::warn!(node, error = %err, "state mirror task failed"),
            }
        }
    })
}
