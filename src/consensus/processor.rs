use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{
        mpsc::{error::TrySendError, Receiver, Sender},
        Mutex,
    },
    time::{timeout_at, Instant},
};

use super::{
    message::{Accept, Ballot, Block, Message, NodeId, Promise, Transaction},
    peers::Topology,
    replica::Replica,
};
use crate::common::error::{ConsensusError, Phase};

/*
    One round, driven by the node that needs the agreed ledger state:

    1. Prepare: issue a fresh ballot, promise it to ourselves, send it to
       every peer.
    2. Collect promises until self plus peers form a quorum. Adopt the
       longest chain reported and look for a block an earlier leader got
       accepted for the next sequence number.
    3. Accept: self-accept the block, send it to every peer.
    4. Collect accepts until quorum, commit, broadcast Decide.

    A rejection carrying a higher ballot or a missed deadline fails the
    round; the caller retries with a higher ballot. A failed round may still
    have had its block chosen, by a quorum that accepted it and a later
    leader that finished it. The caller hands back every block its earlier
    attempts proposed, and a retry that finds one of them committed or
    recovered reports it instead of proposing the transfer again.
*/

/// Addressed message leaving this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub message: Message,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Our block, carrying the triggering transfer, was chosen at `seq`.
    Committed { seq: u64 },
    /// An earlier leader's accepted block was finished instead.
    Recovered { block: Block },
    /// Reconciled balance cannot cover the transfer; nothing was proposed.
    Insufficient { balance: i64 },
}

pub struct ConsensusProcessor {
    pub id: NodeId,
    pub topology: Topology,
    pub replica: Arc<Mutex<Replica>>,
    pub round_timeout: Duration,
    pub msg_tx: Sender<Outbound>,
    responses_tx: Sender<Message>,
    // holding this lock is what makes a round exclusive
    responses_rx: Mutex<Receiver<Message>>,
}

impl ConsensusProcessor {
    pub fn new(
        topology: Topology,
        replica: Arc<Mutex<Replica>>,
        round_timeout: Duration,
        msg_tx: Sender<Outbound>,
    ) -> Self {
        let (responses_tx, responses_rx) = tokio::sync::mpsc::channel(100);
        ConsensusProcessor {
            id: topology.id,
            topology,
            replica,
            round_timeout,
            msg_tx,
            responses_tx,
            responses_rx: Mutex::new(responses_rx),
        }
    }

    /// Entry point for consensus traffic from peers.
    pub async fn handle_message(&self, message: Message) {
        match message {
            Message::Prepare(prepare) => {
                let reply = self.replica.lock().await.on_prepare(&prepare);
                self.send(prepare.from, reply).await;
            }
            Message::Accept(accept) => {
                let from = accept.from;
                let reply = self.replica.lock().await.on_accept(accept);
                self.send(from, reply).await;
            }
            Message::Decide(decide) => {
                self.replica.lock().await.on_decide(decide);
            }
            Message::Promise(_) | Message::Accepted(_) | Message::Reject(_) => {
                match self.responses_tx.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(message)) => {
                        tracing::debug!(node = self.id, kind = message.kind(), "response queue full, dropped");
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            other => {
                tracing::warn!(node = self.id, kind = other.kind(), "not a consensus message");
            }
        }
    }

    /// Runs one round for `txn`. With `check_funds`, the transfer is only
    /// proposed if the reconciled balance covers it. `proposed` carries the
    /// blocks earlier attempts for the same transfer put up; a fresh block
    /// proposed by this round is appended to it.
    pub async fn run_round(
        &self,
        txn: &Transaction,
        check_funds: bool,
        proposed: &mut Vec<Block>,
    ) -> Result<RoundOutcome, ConsensusError> {
        let mut responses = self.responses_rx.lock().await;
        while responses.try_recv().is_ok() {}

        let prepare = self.replica.lock().await.begin_round();
        let ballot = prepare.ballot;
        tracing::info!(node = self.id, %ballot, "starting round");
        self.broadcast(Message::Prepare(prepare)).await;

        let promises = match self.collect_promises(&mut responses, ballot).await {
            Ok(promises) => promises,
            Err(err) => {
                self.fail(ballot, &err).await;
                return Err(err);
            }
        };
        let heights: HashMap<NodeId, u64> = promises.iter().map(|p| (p.from, p.height)).collect();

        let (block, outcome) = {
            let mut replica = self.replica.lock().await;
            let recovered = match replica.reconcile(ballot, promises) {
                Ok(recovered) => recovered,
                Err(err) => {
                    drop(replica);
                    self.fail(ballot, &err).await;
                    return Err(err);
                }
            };
            if let Some(seq) = proposed
                .iter()
                .find(|block| replica.ledger().block(block.seq) == Some(*block))
                .map(|block| block.seq)
            {
                tracing::info!(node = self.id, %ballot, seq, "earlier attempt already chosen");
                replica.abandon(ballot);
                return Ok(RoundOutcome::Committed { seq });
            }
            let (block, outcome) = match recovered {
                Some(block) if proposed.contains(&block) => {
                    tracing::info!(node = self.id, %ballot, seq = block.seq, "finishing earlier attempt");
                    let outcome = RoundOutcome::Committed { seq: block.seq };
                    (block, outcome)
                }
                Some(block) => {
                    tracing::info!(node = self.id, %ballot, seq = block.seq, "recovering accepted block");
                    let outcome = RoundOutcome::Recovered { block: block.clone() };
                    (block, outcome)
                }
                None => {
                    let balance = replica.ledger().local_balance();
                    if check_funds && balance < txn.signed_amount() {
                        replica.abandon(ballot);
                        return Ok(RoundOutcome::Insufficient { balance });
                    }
                    let block = replica.fresh_block(txn.clone());
                    proposed.push(block.clone());
                    let outcome = RoundOutcome::Committed { seq: block.seq };
                    (block, outcome)
                }
            };
            if let Err(err) = replica.self_accept(ballot, &block) {
                drop(replica);
                self.fail(ballot, &err).await;
                return Err(err);
            }
            for peer in self.topology.peers() {
                let catch_up = heights
                    .get(&peer)
                    .map(|height| replica.catch_up_for(*height, block.seq))
                    .unwrap_or_default();
                self.queue(
                    peer,
                    Message::Accept(Accept {
                        ballot,
                        from: self.id,
                        block: block.clone(),
                        catch_up,
                    }),
                );
            }
            (block, outcome)
        };

        if let Err(err) = self.collect_accepts(&mut responses, ballot, block.seq).await {
            self.fail(ballot, &err).await;
            return Err(err);
        }

        let decide = self.replica.lock().await.decide(ballot, block);
        tracing::info!(node = self.id, %ballot, seq = decide.block.seq, "round decided");
        self.broadcast(Message::Decide(decide)).await;
        Ok(outcome)
    }

    async fn collect_promises(
        &self,
        responses: &mut Receiver<Message>,
        ballot: Ballot,
    ) -> Result<Vec<Promise>, ConsensusError> {
        let needed = self.topology.peer_quorum();
        let peers = self.topology.peers().len();
        let deadline = Instant::now() + self.round_timeout;
        let mut promises: Vec<Promise> = Vec::new();
        let mut rejected: Vec<NodeId> = Vec::new();

        while promises.len() < needed {
            let message = match timeout_at(deadline, responses.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(ConsensusError::ChannelClosed),
                Err(_) => {
                    return Err(ConsensusError::QuorumTimeout {
                        phase: Phase::Prepare,
                        received: promises.len(),
                        needed,
                    })
                }
            };
            match message {
                Message::Promise(promise) if promise.ballot == ballot => {
                    if promises.iter().all(|p| p.from != promise.from) {
                        tracing::debug!(node = self.id, peer = promise.from, %ballot, "promise received");
                        promises.push(promise);
                    }
                }
                Message::Reject(reject) if reject.ballot == ballot => {
                    if !rejected.contains(&reject.from) {
                        rejected.push(reject.from);
                    }
                    if reject.promised > ballot {
                        return Err(ConsensusError::Superseded {
                            ballot,
                            by: reject.promised,
                        });
                    }
                    if peers.saturating_sub(rejected.len()) < needed {
                        return Err(ConsensusError::Rejected {
                            phase: Phase::Prepare,
                            ballot,
                        });
                    }
                }
                stale => {
                    tracing::trace!(node = self.id, kind = stale.kind(), "stale response ignored");
                }
            }
        }
        Ok(promises)
    }

    async fn collect_accepts(
        &self,
        responses: &mut Receiver<Message>,
        ballot: Ballot,
        seq: u64,
    ) -> Result<(), ConsensusError> {
        let needed = self.topology.peer_quorum();
        let peers = self.topology.peers().len();
        let deadline = Instant::now() + self.round_timeout;
        let mut accepted: Vec<NodeId> = Vec::new();
        let mut rejected: Vec<NodeId> = Vec::new();

        while accepted.len() < needed {
            let message = match timeout_at(deadline, responses.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(ConsensusError::ChannelClosed),
                Err(_) => {
                    return Err(ConsensusError::QuorumTimeout {
                        phase: Phase::Accept,
                        received: accepted.len(),
                        needed,
                    })
                }
            };
            match message {
                Message::Accepted(ack) if ack.ballot == ballot && ack.seq == seq => {
                    if !accepted.contains(&ack.from) {
                        tracing::debug!(node = self.id, peer = ack.from, %ballot, seq, "accepted received");
                        accepted.push(ack.from);
                    }
                }
                Message::Reject(reject) if reject.ballot == ballot => {
                    if !rejected.contains(&reject.from) {
                        rejected.push(reject.from);
                    }
                    if reject.promised > ballot {
                        return Err(ConsensusError::Superseded {
                            ballot,
                            by: reject.promised,
                        });
                    }
                    if peers.saturating_sub(rejected.len()) < needed {
                        return Err(ConsensusError::Rejected {
                            phase: Phase::Accept,
                            ballot,
                        });
                    }
                }
                stale => {
                    tracing::trace!(node = self.id, kind = stale.kind(), "stale response ignored");
                }
            }
        }
        Ok(())
    }

    async fn fail(&self, ballot: Ballot, err: &ConsensusError) {
        tracing::warn!(node = self.id, %ballot, error = %err, "round failed");
        let mut replica = self.replica.lock().await;
        if let ConsensusError::Superseded { by, .. } = err {
            replica.observe(*by);
        }
        replica.abandon(ballot);
    }

    async fn broadcast(&self, message: Message) {
        for peer in self.topology.peers() {
            self.send(peer, message.clone()).await;
        }
    }

    async fn send(&self, to: NodeId, message: Message) {
        if self.msg_tx.send(Outbound { to, message }).await.is_err() {
            tracing::warn!(node = self.id, peer = to, "outbound channel closed");
        }
    }

    /// Non-blocking send, used while the replica lock is held.
    fn queue(&self, to: NodeId, message: Message) {
        if let Err(err) = self.msg_tx.try_send(Outbound { to, message }) {
            tracing::warn!(node = self.id, peer = to, error = %err, "outbound message dropped");
        }
    }
}
