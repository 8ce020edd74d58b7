use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::crypto::{digest_of, Digest, Hashable};

/*
    Messages travel as one JSON object per line. Every object carries a
    `type` tag; client requests and consensus traffic share the same
    stream format, so a node can accept both on a single listener.

    Prepare/Promise elect a proposer for the next sequence number,
    Accept/Accepted replicate its block to a quorum and Decide tells
    every peer the block is chosen.
*/

pub type NodeId = u64;
pub type ClientId = u64;

/// Totally ordered on `(seq, proposer)`: equal sequence numbers are won by
/// the larger proposer id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    #[serde(rename = "ballotSeq")]
    pub seq: u64,
    #[serde(rename = "proposerId")]
    pub proposer: NodeId,
}

impl Ballot {
    pub fn new(seq: u64, proposer: NodeId) -> Self {
        Ballot { seq, proposer }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.seq, self.proposer)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: ClientId,
    pub receiver: ClientId,
    pub amount: u64,
}

impl Transaction {
    pub fn new(sender: ClientId, receiver: ClientId, amount: u64) -> Self {
        Transaction {
            sender,
            receiver,
            amount,
        }
    }

    /// Amount as a balance delta; amounts past `i64::MAX` saturate.
    pub fn signed_amount(&self) -> i64 {
        i64::try_from(self.amount).unwrap_or(i64::MAX)
    }

    /// Signed effect of this transaction on `client`'s balance.
    pub fn delta_for(&self, client: ClientId) -> i64 {
        let amount = self.signed_amount();
        let mut delta: i64 = 0;
        if self.receiver == client {
            delta = delta.saturating_add(amount);
        }
        if self.sender == client {
            delta = delta.saturating_sub(amount);
        }
        delta
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} : {}", self.sender, self.receiver, self.amount)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub seq: u64,
    pub transactions: Vec<Transaction>,
    pub proposer: NodeId,
}

impl Block {
    pub fn new(seq: u64, transactions: Vec<Transaction>, proposer: NodeId) -> Self {
        Block {
            seq,
            transactions,
            proposer,
        }
    }
}

impl Hashable for Block {
    fn hash(&self) -> Digest {
        let mut body = Vec::with_capacity(self.transactions.len() * 24);
        for txn in &self.transactions {
            body.extend_from_slice(&txn.sender.to_be_bytes());
            body.extend_from_slice(&txn.receiver.to_be_bytes());
            body.extend_from_slice(&txn.amount.to_be_bytes());
        }
        digest_of(&[
            &self.seq.to_be_bytes(),
            &self.proposer.to_be_bytes(),
            &body,
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "TRANSACTION_MESSAGE")]
    Transfer(Transaction),
    #[serde(rename = "SHOW_BALANCE")]
    ShowBalance,
    #[serde(rename = "SHOW_LOG_MESSAGE")]
    ShowLog,
    #[serde(rename = "SHOW_BLOCKCHAIN_MESSAGE")]
    ShowBlockchain,
    #[serde(rename = "PREPARE_MESSAGE")]
    Prepare(Prepare),
    #[serde(rename = "PROMISE_MESSAGE")]
    Promise(Promise),
    #[serde(rename = "ACCEPT_MESSAGE")]
    Accept(Accept),
    #[serde(rename = "ACCEPTED_MESSAGE")]
    Accepted(Accepted),
    #[serde(rename = "REJECT_MESSAGE")]
    Reject(Reject),
    #[serde(rename = "DECIDE_MESSAGE")]
    Decide(Decide),
}

impl Message {
    /// Sending peer for consensus traffic, `None` for client requests.
    pub fn sender(&self) -> Option<NodeId> {
        match self {
            Message::Prepare(m) => Some(m.from),
            Message::Promise(m) => Some(m.from),
            Message::Accept(m) => Some(m.from),
            Message::Accepted(m) => Some(m.from),
            Message::Reject(m) => Some(m.from),
            Message::Decide(m) => Some(m.from),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Transfer(_) => "transfer",
            Message::ShowBalance => "show-balance",
            Message::ShowLog => "show-log",
            Message::ShowBlockchain => "show-blockchain",
            Message::Prepare(_) => "prepare",
            Message::Promise(_) => "promise",
            Message::Accept(_) => "accept",
            Message::Accepted(_) => "accepted",
            Message::Reject(_) => "reject",
            Message::Decide(_) => "decide",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    #[serde(flatten)]
    pub ballot: Ballot,
    pub from: NodeId,
    /// Proposer's committed height, so promises only ship newer blocks.
    pub height: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedValue {
    pub ballot: Ballot,
    pub block: Block,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    #[serde(flatten)]
    pub ballot: Ballot,
    pub from: NodeId,
    pub height: u64,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub accepted: Option<AcceptedValue>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    #[serde(flatten)]
    pub ballot: Ballot,
    pub from: NodeId,
    pub block: Block,
    #[serde(default)]
    pub catch_up: Vec<Block>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    #[serde(flatten)]
    pub ballot: Ballot,
    pub from: NodeId,
    pub seq: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    #[serde(flatten)]
    pub ballot: Ballot,
    pub from: NodeId,
    pub promised: Ballot,
    pub height: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decide {
    #[serde(flatten)]
    pub ballot: Ballot,
    pub from: NodeId,
    pub block: Block,
}

/// Responses written back to clients on their own connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    #[serde(rename = "SHOW_BALANCE")]
    Balance {
        balance: i64,
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    #[serde(rename = "TRANSACTION_MESSAGE")]
    Transfer {
        committed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}
