use std::sync::Arc;

use tokio::sync::{
    mpsc::{self, Receiver},
    watch, Mutex,
};

use crate::{
    common::{
        config::Config,
        error::{AdmissionError, NodeError},
    },
    consensus::{
        admission::{Admission, AdmissionController},
        ballot::Role,
        message::{Block, ClientId, Message, NodeId, Reply, Transaction},
        processor::{ConsensusProcessor, Outbound},
        replica::Replica,
        store::{spawn_persister, LogStore},
    },
};

/// One member of the cluster and everything it owns. Several nodes can live
/// in one process; nothing here is global.
pub struct Node {
    pub id: NodeId,
    pub client: ClientId,
    pub processor: Arc<ConsensusProcessor>,
    admission: AdmissionController,
}

impl Node {
    /// Builds the node, restoring its chain, local log and ballot floor from
    /// `store` first. The
    /// returned receiver carries every message the node wants delivered to a
    /// peer. Spawns the log mirror, so it needs a running tokio runtime.
    pub fn bootstrap(config: &Config, store: Arc<dyn LogStore>) -> Result<(Arc<Node>, Receiver<Outbound>), NodeError> {
        let topology = config.topology()?;
        let id = topology.id;

        let restored = store.load(id)?;
        if !restored.is_empty() {
            tracing::info!(
                node = id,
                pending = restored.local_log.len(),
                height = restored.blockchain.len(),
                promised = ?restored.promised,
                "restored state"
            );
        }
        let (journal, snapshots) = watch::channel(restored.clone());
        let replica = Replica::restore(id, config.starting_balance, restored, journal)?;
        spawn_persister(store, id, snapshots);

        let replica = Arc::new(Mutex::new(replica));
        let (msg_tx, msg_rx) = mpsc::channel(100);
        let processor = Arc::new(ConsensusProcessor::new(
            topology,
            replica,
            config.round_timeout(),
            msg_tx,
        ));
        let admission = AdmissionController::new(
            id,
            config.admission,
            config.max_round_attempts,
            config.retry_jitter(),
            processor.clone(),
        );

        let node = Node {
            id,
            client: id,
            processor,
            admission,
        };
        Ok((Arc::new(node), msg_rx))
    }

    /// Dispatches one decoded message. Client requests get a reply; peer
    /// traffic is answered through the outbound queue.
    pub async fn route(&self, message: Message) -> Option<Reply> {
        match message {
            Message::Transfer(txn) => Some(match self.transfer(txn).await {
                Ok(admission) => Reply::Transfer {
                    committed: true,
                    seq: match admission {
                        Admission::Local { .. } => None,
                        Admission::Consensus { seq, .. } => Some(seq),
                    },
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(node = self.id, error = %err, "transfer refused");
                    Reply::Transfer {
                        committed: false,
                        seq: None,
                        error: Some(err.to_string()),
                    }
                }
            }),
            Message::ShowBalance => Some(Reply::Balance {
                balance: self.balance().await,
                client_id: self.client,
            }),
            Message::ShowLog => {
                let dump = self.processor.replica.lock().await.ledger().log_dump();
                tracing::info!(node = self.id, "{}", dump);
                None
            }
            Message::ShowBlockchain => {
                let dump = self.processor.replica.lock().await.ledger().blockchain_dump();
                tracing::info!(node = self.id, "{}", dump);
                None
            }
            consensus => {
                match consensus.sender() {
                    Some(peer) if peer != self.id && self.processor.topology.is_member(peer) => {
                        self.processor.handle_message(consensus).await;
                    }
                    from => {
                        tracing::warn!(node = self.id, ?from, kind = consensus.kind(), "message from unknown peer dropped");
                    }
                }
                None
            }
        }
    }

    pub async fn transfer(&self, txn: Transaction) -> Result<Admission, AdmissionError> {
        self.admission.submit(txn).await
    }

    pub async fn balance(&self) -> i64 {
        self.processor.replica.lock().await.ledger().local_balance()
    }

    pub async fn committed_balance(&self) -> i64 {
        self.processor.replica.lock().await.ledger().committed_balance()
    }

    pub async fn blockchain(&self) -> Vec<Block> {
        self.processor.replica.lock().await.ledger().blockchain().to_vec()
    }

    pub async fn local_log(&self) -> Vec<Transaction> {
        self.processor.replica.lock().await.ledger().local_log().to_vec()
    }

    pub async fn role(&self) -> Role {
        self.processor.replica.lock().await.role()
    }
}
