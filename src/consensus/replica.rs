use tokio::sync::watch;

use super::{
    ballot::{BallotArbiter, Role},
    ledger::Ledger,
    message::{
        Accept, Accepted, AcceptedValue, Ballot, Block, Decide, Message, NodeId, Prepare, Promise, Reject,
        Transaction,
    },
    store::Snapshot,
};
use crate::common::{
    crypto::{short_hex, Hashable},
    error::{ConsensusError, StoreError},
};

/*
    Everything a node mutates on behalf of consensus and admission lives
    here and is only touched under the node's mutex, so ballot checks,
    local appends and block commits never interleave.

    Blocks are committed only once chosen. An accepted block is held
    aside until a Decide arrives or a later leader recovers it from a
    promise.

    Every change is published as a snapshot on `journal` for the durable
    mirror; a restarted replica resumes from the last one written.
*/

pub struct Replica {
    pub id: NodeId,
    arbiter: BallotArbiter,
    ledger: Ledger,
    accepted: Option<AcceptedValue>,
    journal: watch::Sender<Snapshot>,
}

impl Replica {
    pub fn new(id: NodeId, ledger: Ledger, journal: watch::Sender<Snapshot>) -> Self {
        Replica {
            id,
            arbiter: BallotArbiter::new(id),
            ledger,
            accepted: None,
            journal,
        }
    }

    /// Rebuilds the state a previous run mirrored. The stored chain must be
    /// gapless from sequence 1.
    pub fn restore(
        id: NodeId,
        starting_balance: i64,
        snapshot: Snapshot,
        journal: watch::Sender<Snapshot>,
    ) -> Result<Self, StoreError> {
        let mut ledger = Ledger::with_local_log(id, starting_balance, snapshot.local_log);
        for block in snapshot.blockchain {
            if block.seq != ledger.next_seq() {
                return Err(StoreError::Gap { node: id, seq: block.seq });
            }
            ledger.commit_block(block);
        }
        let accepted = snapshot
            .accepted
            .filter(|value| value.block.seq == ledger.next_seq());
        Ok(Replica {
            id,
            arbiter: BallotArbiter::restore(id, snapshot.promised),
            ledger,
            accepted,
            journal,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn arbiter(&self) -> &BallotArbiter {
        &self.arbiter
    }

    pub fn role(&self) -> Role {
        self.arbiter.role()
    }

    pub fn accepted(&self) -> Option<&AcceptedValue> {
        self.accepted.as_ref()
    }

    pub fn append_local(&mut self, txn: Transaction) {
        self.ledger.append_local(txn);
        self.publish();
    }

    // ------------------------------------
    // Acceptor side
    // ------------------------------------

    pub fn on_prepare(&mut self, prepare: &Prepare) -> Message {
        match self.arbiter.on_prepare(prepare.ballot) {
            Ok(()) => {
                tracing::debug!(node = self.id, ballot = %prepare.ballot, "promised");
                self.publish();
                Message::Promise(Promise {
                    ballot: prepare.ballot,
                    from: self.id,
                    height: self.ledger.height(),
                    blocks: self.ledger.blocks_after(prepare.height),
                    accepted: self.pending_accepted(),
                })
            }
            Err(highest) => {
                tracing::debug!(node = self.id, ballot = %prepare.ballot, %highest, "prepare rejected");
                self.reject(prepare.ballot, highest)
            }
        }
    }

    pub fn on_accept(&mut self, accept: Accept) -> Message {
        if let Err(highest) = self.arbiter.on_accept(accept.ballot) {
            tracing::debug!(node = self.id, ballot = %accept.ballot, %highest, "accept rejected");
            return self.reject(accept.ballot, highest);
        }
        self.adopt(accept.catch_up);

        let seq = accept.block.seq;
        if seq == self.ledger.next_seq() {
            self.accepted = Some(AcceptedValue {
                ballot: accept.ballot,
                block: accept.block,
            });
        } else if self.ledger.block(seq) != Some(&accept.block) {
            tracing::debug!(
                node = self.id,
                seq,
                height = self.ledger.height(),
                "accept does not fit local chain"
            );
            return self.reject(accept.ballot, accept.ballot);
        }
        self.publish();

        Message::Accepted(Accepted {
            ballot: accept.ballot,
            from: self.id,
            seq,
        })
    }

    pub fn on_decide(&mut self, decide: Decide) {
        let seq = decide.block.seq;
        if !self.commit(decide.block) {
            tracing::debug!(node = self.id, seq, height = self.ledger.height(), "decide not applied");
        }
        self.arbiter.conclude(decide.ballot);
        self.publish();
    }

    // ------------------------------------
    // Proposer side
    // ------------------------------------

    pub fn begin_round(&mut self) -> Prepare {
        let ballot = self.arbiter.next_ballot();
        self.publish();
        Prepare {
            ballot,
            from: self.id,
            height: self.ledger.height(),
        }
    }

    /// Records a competing ballot seen in a rejection.
    pub fn observe(&mut self, ballot: Ballot) {
        self.arbiter.observe(ballot);
    }

    /// Takes leadership for `ballot` after a promise quorum, adopts the
    /// longest chain reported and returns the block some earlier leader got
    /// accepted for the next sequence number, if any.
    pub fn reconcile(&mut self, ballot: Ballot, promises: Vec<Promise>) -> Result<Option<Block>, ConsensusError> {
        if !self.arbiter.elect(ballot) {
            return Err(self.superseded(ballot));
        }
        tracing::debug!(node = self.id, %ballot, "leading");

        let mut promises = promises;
        promises.sort_by_key(|promise| std::cmp::Reverse(promise.height));
        let mut candidates: Vec<AcceptedValue> = self.accepted.iter().cloned().collect();
        for promise in promises {
            self.adopt(promise.blocks);
            candidates.extend(promise.accepted);
        }

        let next = self.ledger.next_seq();
        Ok(candidates
            .into_iter()
            .filter(|value| value.block.seq == next)
            .max_by_key(|value| value.ballot)
            .map(|value| value.block))
    }

    /// Fresh candidate: the pending log followed by the triggering transfer.
    pub fn fresh_block(&self, txn: Transaction) -> Block {
        let mut transactions = self.ledger.local_log().to_vec();
        transactions.push(txn);
        Block::new(self.ledger.next_seq(), transactions, self.id)
    }

    /// Accepts our own proposal, unless a higher ballot got in first.
    pub fn self_accept(&mut self, ballot: Ballot, block: &Block) -> Result<(), ConsensusError> {
        if !self.arbiter.holds(ballot) {
            return Err(self.superseded(ballot));
        }
        self.accepted = Some(AcceptedValue {
            ballot,
            block: block.clone(),
        });
        self.publish();
        Ok(())
    }

    /// Blocks a lagging peer needs before it can accept at `block_seq`.
    pub fn catch_up_for(&self, peer_height: u64, block_seq: u64) -> Vec<Block> {
        self.ledger
            .blocks_after(peer_height)
            .into_iter()
            .take_while(|block| block.seq < block_seq)
            .collect()
    }

    /// Commits the chosen block and ends the round.
    pub fn decide(&mut self, ballot: Ballot, block: Block) -> Decide {
        let decide = Decide {
            ballot,
            from: self.id,
            block: block.clone(),
        };
        if !self.commit(block) {
            tracing::warn!(node = self.id, %ballot, "decided block did not extend local chain");
        }
        self.arbiter.conclude(ballot);
        decide
    }

    pub fn abandon(&mut self, ballot: Ballot) {
        self.arbiter.conclude(ballot);
    }

    // ------------------------------------
    // Chain maintenance
    // ------------------------------------

    /// Appends chosen blocks that extend the local chain; others are skipped.
    fn adopt(&mut self, blocks: Vec<Block>) {
        for block in blocks {
            if block.seq == self.ledger.next_seq() {
                self.commit(block);
            }
        }
    }

    fn commit(&mut self, block: Block) -> bool {
        let seq = block.seq;
        if seq != self.ledger.next_seq() {
            if let Some(existing) = self.ledger.block(seq) {
                if existing != &block {
                    tracing::error!(
                        node = self.id,
                        seq,
                        local = %short_hex(&existing.hash()),
                        remote = %short_hex(&block.hash()),
                        "conflicting block for committed sequence"
                    );
                }
            }
            return false;
        }

        let settled = self.settled_by(&block);
        tracing::info!(
            node = self.id,
            seq,
            proposer = block.proposer,
            txns = block.transactions.len(),
            "block committed"
        );
        self.ledger.commit_block(block);
        if self.accepted.as_ref().is_some_and(|value| value.block.seq <= seq) {
            self.accepted = None;
        }
        if settled > 0 {
            self.ledger.settle_local(settled);
        }
        self.publish();
        true
    }

    /// Own blocks carry the pending log as a prefix ahead of the transfer
    /// that triggered the round.
    fn settled_by(&self, block: &Block) -> usize {
        if block.proposer != self.id || block.transactions.is_empty() {
            return 0;
        }
        let carried = &block.transactions[..block.transactions.len() - 1];
        if self.ledger.local_log().starts_with(carried) {
            carried.len()
        } else {
            0
        }
    }

    fn pending_accepted(&self) -> Option<AcceptedValue> {
        self.accepted
            .clone()
            .filter(|value| value.block.seq == self.ledger.next_seq())
    }

    fn reject(&self, ballot: Ballot, promised: Ballot) -> Message {
        Message::Reject(Reject {
            ballot,
            from: self.id,
            promised,
            height: self.ledger.height(),
        })
    }

    fn superseded(&self, ballot: Ballot) -> ConsensusError {
        ConsensusError::Superseded {
            ballot,
            by: self.arbiter.highest().unwrap_or(ballot),
        }
    }

    /// Latest durable state; the mirror writes whichever snapshot is newest.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            local_log: self.ledger.local_log().to_vec(),
            blockchain: self.ledger.blockchain().to_vec(),
            promised: self.arbiter.highest(),
            accepted: self.accepted.clone(),
        }
    }

    fn publish(&self) {
        self.journal.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: NodeId) -> (Replica, watch::Receiver<Snapshot>) {
        let (tx, rx) = watch::channel(Snapshot::default());
        (Replica::new(id, Ledger::new(id), tx), rx)
    }

    fn promise_from(message: Message) -> Promise {
        match message {
            Message::Promise(promise) => promise,
            other => panic!("expected promise, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_promises_higher_ballot() {
        let (mut acceptor, _rx) = replica(2);
        let reply = acceptor.on_prepare(&Prepare {
            ballot: Ballot::new(1, 1),
            from: 1,
            height: 0,
        });

        let promise = promise_from(reply);
        assert_eq!(promise.ballot, Ballot::new(1, 1));
        assert_eq!(promise.from, 2);
        assert!(acceptor.arbiter().is_promised());
    }

    #[test]
    fn test_prepare_rejects_stale_ballot() {
        let (mut acceptor, _rx) = replica(2);
        acceptor.on_prepare(&Prepare {
            ballot: Ballot::new(5, 2),
            from: 2,
            height: 0,
        });

        match acceptor.on_prepare(&Prepare {
            ballot: Ballot::new(5, 1),
            from: 1,
            height: 0,
        }) {
            Message::Reject(reject) => assert_eq!(reject.promised, Ballot::new(5, 2)),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[test]
    fn test_promise_ships_blocks_above_proposer_height() {
        let (mut acceptor, _rx) = replica(2);
        acceptor.commit(Block::new(1, vec![Transaction::new(2, 1, 1)], 2));
        acceptor.commit(Block::new(2, vec![Transaction::new(2, 3, 1)], 2));

        let promise = promise_from(acceptor.on_prepare(&Prepare {
            ballot: Ballot::new(1, 1),
            from: 1,
            height: 1,
        }));
        assert_eq!(promise.height, 2);
        assert_eq!(promise.blocks.len(), 1);
        assert_eq!(promise.blocks[0].seq, 2);
    }

    #[test]
    fn test_accept_then_decide_commits() {
        let (mut acceptor, _rx) = replica(2);
        let ballot = Ballot::new(1, 1);
        let block = Block::new(1, vec![Transaction::new(1, 2, 5)], 1);

        let reply = acceptor.on_accept(Accept {
            ballot,
            from: 1,
            block: block.clone(),
            catch_up: vec![],
        });
        assert!(matches!(reply, Message::Accepted(Accepted { seq: 1, .. })));
        assert_eq!(acceptor.ledger().height(), 0);
        assert_eq!(acceptor.accepted().map(|v| v.ballot), Some(ballot));

        acceptor.on_decide(Decide {
            ballot,
            from: 1,
            block,
        });
        assert_eq!(acceptor.ledger().height(), 1);
        assert_eq!(acceptor.ledger().local_balance(), 105);
        assert!(acceptor.accepted().is_none());
        assert!(!acceptor.arbiter().is_promised());
    }

    #[test]
    fn test_accept_rejects_lower_ballot() {
        let (mut acceptor, _rx) = replica(2);
        acceptor.on_prepare(&Prepare {
            ballot: Ballot::new(5, 2),
            from: 2,
            height: 0,
        });

        let reply = acceptor.on_accept(Accept {
            ballot: Ballot::new(4, 3),
            from: 3,
            block: Block::new(1, vec![], 3),
            catch_up: vec![],
        });
        assert!(matches!(reply, Message::Reject(_)));
        assert!(acceptor.accepted().is_none());
    }

    #[test]
    fn test_accept_applies_catch_up() {
        let (mut acceptor, _rx) = replica(3);
        let history = vec![Block::new(1, vec![Transaction::new(1, 3, 10)], 1)];

        let reply = acceptor.on_accept(Accept {
            ballot: Ballot::new(2, 1),
            from: 1,
            block: Block::new(2, vec![Transaction::new(1, 2, 1)], 1),
            catch_up: history,
        });
        assert!(matches!(reply, Message::Accepted(Accepted { seq: 2, .. })));
        assert_eq!(acceptor.ledger().height(), 1);
        assert_eq!(acceptor.ledger().committed_balance(), 110);
    }

    #[test]
    fn test_accept_with_gap_is_rejected() {
        let (mut acceptor, _rx) = replica(3);
        let reply = acceptor.on_accept(Accept {
            ballot: Ballot::new(2, 1),
            from: 1,
            block: Block::new(3, vec![], 1),
            catch_up: vec![],
        });
        assert!(matches!(reply, Message::Reject(_)));
    }

    #[test]
    fn test_reconcile_adopts_longest_chain() {
        let (mut proposer, _rx) = replica(1);
        let prepare = proposer.begin_round();
        let chain = vec![
            Block::new(1, vec![Transaction::new(2, 1, 20)], 2),
            Block::new(2, vec![Transaction::new(3, 1, 5)], 3),
        ];
        let promises = vec![
            Promise {
                ballot: prepare.ballot,
                from: 2,
                height: 1,
                blocks: chain[..1].to_vec(),
                accepted: None,
            },
            Promise {
                ballot: prepare.ballot,
                from: 3,
                height: 2,
                blocks: chain.clone(),
                accepted: None,
            },
        ];

        let recovered = proposer.reconcile(prepare.ballot, promises).unwrap();
        assert!(recovered.is_none());
        assert_eq!(proposer.ledger().blockchain(), &chain[..]);
        assert_eq!(proposer.ledger().committed_balance(), 125);
        assert_eq!(proposer.role(), Role::Leader);
    }

    #[test]
    fn test_reconcile_recovers_highest_accepted() {
        let (mut proposer, _rx) = replica(1);
        let prepare = proposer.begin_round();
        let older = Block::new(1, vec![Transaction::new(2, 3, 1)], 2);
        let newer = Block::new(1, vec![Transaction::new(3, 2, 1)], 3);
        let promises = vec![
            Promise {
                ballot: prepare.ballot,
                from: 2,
                height: 0,
                blocks: vec![],
                accepted: Some(AcceptedValue {
                    ballot: Ballot::new(0, 2),
                    block: older,
                }),
            },
            Promise {
                ballot: prepare.ballot,
                from: 3,
                height: 0,
                blocks: vec![],
                accepted: Some(AcceptedValue {
                    ballot: Ballot::new(0, 3),
                    block: newer.clone(),
                }),
            },
        ];

        assert_eq!(proposer.reconcile(prepare.ballot, promises).unwrap(), Some(newer));
    }

    #[test]
    fn test_reconcile_fails_after_higher_promise() {
        let (mut proposer, _rx) = replica(1);
        let prepare = proposer.begin_round();
        proposer.on_prepare(&Prepare {
            ballot: Ballot::new(prepare.ballot.seq, 3),
            from: 3,
            height: 0,
        });

        assert!(matches!(
            proposer.reconcile(prepare.ballot, vec![]),
            Err(ConsensusError::Superseded { .. })
        ));
    }

    #[test]
    fn test_own_block_settles_pending_log() {
        let (mut proposer, rx) = replica(1);
        proposer.append_local(Transaction::new(1, 2, 10));
        proposer.append_local(Transaction::new(1, 3, 10));
        assert_eq!(rx.borrow().local_log.len(), 2);

        let prepare = proposer.begin_round();
        proposer.reconcile(prepare.ballot, vec![]).unwrap();
        let block = proposer.fresh_block(Transaction::new(1, 2, 75));
        assert_eq!(block.transactions.len(), 3);

        proposer.self_accept(prepare.ballot, &block).unwrap();
        proposer.append_local(Transaction::new(1, 3, 1));
        let decide = proposer.decide(prepare.ballot, block);

        assert_eq!(decide.block.seq, 1);
        assert_eq!(proposer.ledger().local_log(), &[Transaction::new(1, 3, 1)]);
        assert_eq!(proposer.ledger().local_balance(), 4);
        assert_eq!(rx.borrow().local_log.len(), 1);
        assert_eq!(rx.borrow().blockchain.len(), 1);
    }

    #[test]
    fn test_restore_keeps_chain_log_and_floor() {
        let (mut before, rx) = replica(1);
        before.append_local(Transaction::new(1, 2, 60));
        let prepare = before.begin_round();
        before.reconcile(prepare.ballot, vec![]).unwrap();
        let block = before.fresh_block(Transaction::new(1, 3, 30));
        before.self_accept(prepare.ballot, &block).unwrap();
        before.decide(prepare.ballot, block);
        before.on_prepare(&Prepare {
            ballot: Ballot::new(5, 2),
            from: 2,
            height: 1,
        });
        assert_eq!(before.ledger().local_balance(), 10);

        let snapshot = rx.borrow().clone();
        assert!(snapshot.local_log.is_empty());
        let (tx, _rx) = watch::channel(snapshot.clone());
        let mut after = Replica::restore(1, 100, snapshot, tx).unwrap();

        assert_eq!(after.ledger().local_balance(), 10);
        assert_eq!(after.ledger().height(), 1);
        match after.on_prepare(&Prepare {
            ballot: Ballot::new(4, 3),
            from: 3,
            height: 0,
        }) {
            Message::Reject(reject) => assert_eq!(reject.promised, Ballot::new(5, 2)),
            other => panic!("expected reject, got {:?}", other),
        }
        assert_eq!(after.begin_round().ballot, Ballot::new(6, 1));
    }

    #[test]
    fn test_restore_refuses_gapped_chain() {
        let snapshot = Snapshot {
            blockchain: vec![Block::new(2, vec![], 2)],
            ..Snapshot::default()
        };
        let (tx, _rx) = watch::channel(Snapshot::default());
        assert!(matches!(
            Replica::restore(1, 100, snapshot, tx),
            Err(StoreError::Gap { node: 1, seq: 2 })
        ));
    }

    #[test]
    fn test_catch_up_for_lagging_peer() {
        let (mut proposer, _rx) = replica(1);
        for seq in 1..=3 {
            proposer.commit(Block::new(seq, vec![], 2));
        }
        let blocks = proposer.catch_up_for(1, 4);
        assert_eq!(blocks.iter().map(|b| b.seq).collect::<Vec<_>>(), vec![2, 3]);
    }
}
