use std::fmt::Write;

use super::message::{Block, ClientId, Transaction};
use crate::common::crypto::{short_hex, Hashable};

pub const STARTING_BALANCE: i64 = 100;

/// Committed blockchain plus the log of transfers accepted locally but not
/// yet folded into a block. Balances are always recomputed from both.
#[derive(Debug, Clone)]
pub struct Ledger {
    client: ClientId,
    starting_balance: i64,
    blockchain: Vec<Block>,
    local_log: Vec<Transaction>,
}

impl Ledger {
    pub fn new(client: ClientId) -> Self {
        Ledger::with_local_log(client, STARTING_BALANCE, Vec::new())
    }

    pub fn with_local_log(client: ClientId, starting_balance: i64, local_log: Vec<Transaction>) -> Self {
        Ledger {
            client,
            starting_balance,
            blockchain: Vec::new(),
            local_log,
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn committed_balance(&self) -> i64 {
        self.blockchain
            .iter()
            .flat_map(|block| block.transactions.iter())
            .fold(self.starting_balance, |balance, txn| balance.saturating_add(txn.delta_for(self.client)))
    }

    pub fn local_balance(&self) -> i64 {
        self.local_log
            .iter()
            .fold(self.committed_balance(), |balance, txn| balance.saturating_add(txn.delta_for(self.client)))
    }

    pub fn append_local(&mut self, txn: Transaction) {
        self.local_log.push(txn);
    }

    /// Appends a chosen block. Callers check `next_seq` first; a gap or a
    /// repeated sequence number is a bug.
    pub fn commit_block(&mut self, block: Block) {
        assert_eq!(
            block.seq,
            self.next_seq(),
            "block {} does not extend a chain of height {}",
            block.seq,
            self.height()
        );
        self.blockchain.push(block);
    }

    /// Removes the first `count` pending transactions once a block carrying
    /// them is committed.
    pub fn settle_local(&mut self, count: usize) {
        let count = count.min(self.local_log.len());
        self.local_log.drain(..count);
    }

    pub fn height(&self) -> u64 {
        self.blockchain.last().map_or(0, |block| block.seq)
    }

    pub fn next_seq(&self) -> u64 {
        self.height() + 1
    }

    pub fn block(&self, seq: u64) -> Option<&Block> {
        if seq == 0 {
            return None;
        }
        self.blockchain.get((seq - 1) as usize)
    }

    pub fn blocks_after(&self, height: u64) -> Vec<Block> {
        self.blockchain.iter().skip(height as usize).cloned().collect()
    }

    pub fn blockchain(&self) -> &[Block] {
        &self.blockchain
    }

    pub fn local_log(&self) -> &[Transaction] {
        &self.local_log
    }

    pub fn log_dump(&self) -> String {
        let mut out = format!("local log of client {} ({} pending)", self.client, self.local_log.len());
        for (i, txn) in self.local_log.iter().enumerate() {
            let _ = write!(out, "\n  [{}] {}", i, txn);
        }
        out
    }

    pub fn blockchain_dump(&self) -> String {
        let mut out = format!("blockchain of client {} (height {})", self.client, self.height());
        for block in &self.blockchain {
            let _ = write!(
                out,
                "\n  #{} by node {} [{}]",
                block.seq,
                block.proposer,
                short_hex(&block.hash())
            );
            for txn in &block.transactions {
                let _ = write!(out, "\n    {}", txn);
            }
        }
        out
    }
}
