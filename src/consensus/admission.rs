use std::{str::FromStr, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{
    message::{ClientId, Transaction},
    processor::{ConsensusProcessor, RoundOutcome},
};
use crate::common::error::{AdmissionError, ConsensusError};

/// When a transfer may be committed from locally known state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionRule {
    /// Local unless `0 <= balance <= amount`. A negative balance is
    /// committed locally too; kept for compatibility with existing clients.
    #[default]
    Literal,
    /// Local only when `balance >= amount`; otherwise reconcile and refuse
    /// if the agreed balance is still short.
    Corrected,
}

impl AdmissionRule {
    pub fn requires_consensus(&self, balance: i64, amount: u64) -> bool {
        let amount = i64::try_from(amount).unwrap_or(i64::MAX);
        match self {
            AdmissionRule::Literal => !(balance < 0 || balance > amount),
            AdmissionRule::Corrected => balance < amount,
        }
    }
}

impl FromStr for AdmissionRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "literal" => Ok(AdmissionRule::Literal),
            "corrected" => Ok(AdmissionRule::Corrected),
            other => Err(format!("unknown admission rule `{}`", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Local { balance: i64 },
    Consensus { seq: u64, balance: i64 },
}

pub struct AdmissionController {
    pub client: ClientId,
    pub rule: AdmissionRule,
    pub max_attempts: u32,
    pub retry_jitter: Duration,
    processor: Arc<ConsensusProcessor>,
}

impl AdmissionController {
    pub fn new(
        client: ClientId,
        rule: AdmissionRule,
        max_attempts: u32,
        retry_jitter: Duration,
        processor: Arc<ConsensusProcessor>,
    ) -> Self {
        AdmissionController {
            client,
            rule,
            max_attempts: max_attempts.max(1),
            retry_jitter,
            processor,
        }
    }

    pub async fn submit(&self, txn: Transaction) -> Result<Admission, AdmissionError> {
        if txn.sender != self.client {
            return Err(AdmissionError::WrongClient {
                expected: self.client,
                found: txn.sender,
            });
        }
        if txn.amount == 0 {
            return Err(AdmissionError::InvalidAmount);
        }
        if i64::try_from(txn.amount).is_err() {
            return Err(AdmissionError::AmountTooLarge {
                amount: txn.amount,
                max: i64::MAX,
            });
        }

        {
            let mut replica = self.processor.replica.lock().await;
            let balance = replica.ledger().local_balance();
            tracing::info!(
                node = self.processor.id,
                balance,
                amount = txn.amount,
                receiver = txn.receiver,
                "checking transfer"
            );
            if !self.rule.requires_consensus(balance, txn.amount) {
                replica.append_local(txn);
                let balance = replica.ledger().local_balance();
                tracing::info!(node = self.processor.id, balance, "transfer committed locally");
                return Ok(Admission::Local { balance });
            }
        }

        let check_funds = self.rule == AdmissionRule::Corrected;
        let mut last = ConsensusError::ChannelClosed;
        let mut proposed = Vec::new();
        for attempt in 1..=self.max_attempts {
            match self.processor.run_round(&txn, check_funds, &mut proposed).await {
                Ok(RoundOutcome::Committed { seq }) => return Ok(self.committed(seq).await),
                Ok(RoundOutcome::Recovered { block }) => {
                    tracing::info!(node = self.processor.id, attempt, seq = block.seq, "slot taken by recovered block");
                }
                Ok(RoundOutcome::Insufficient { balance }) => {
                    return Err(AdmissionError::InsufficientFunds {
                        balance,
                        amount: txn.amount,
                    });
                }
                Err(err) if err.is_transient() => {
                    tracing::info!(node = self.processor.id, attempt, error = %err, "retrying round");
                    last = err;
                    if attempt < self.max_attempts {
                        self.backoff().await;
                    }
                }
                Err(err) => {
                    return Err(AdmissionError::Unavailable { attempts: attempt, last: err });
                }
            }
        }

        Err(AdmissionError::Unavailable {
            attempts: self.max_attempts,
            last,
        })
    }

    async fn committed(&self, seq: u64) -> Admission {
        let balance = self.processor.replica.lock().await.ledger().local_balance();
        tracing::info!(node = self.processor.id, seq, balance, "transfer committed by consensus");
        Admission::Consensus { seq, balance }
    }

    async fn backoff(&self) {
        let max = self.retry_jitter.as_millis() as u64;
        if max == 0 {
            return;
        }
        let delay = rand::thread_rng().gen_range(0..max);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_rule() {
        let rule = AdmissionRule::Literal;
        assert!(!rule.requires_consensus(100, 10));
        assert!(rule.requires_consensus(5, 5));
        assert!(rule.requires_consensus(0, 5));
        assert!(rule.requires_consensus(3, 5));
        // negative balances bypass consensus under the literal rule
        assert!(!rule.requires_consensus(-1, 5));
        assert!(rule.requires_consensus(100, u64::MAX));
    }

    #[test]
    fn test_corrected_rule() {
        let rule = AdmissionRule::Corrected;
        assert!(!rule.requires_consensus(100, 10));
        assert!(!rule.requires_consensus(5, 5));
        assert!(rule.requires_consensus(4, 5));
        assert!(rule.requires_consensus(-1, 5));
    }

    #[test]
    fn test_rule_from_str() {
        assert_eq!("literal".parse::<AdmissionRule>(), Ok(AdmissionRule::Literal));
        assert_eq!("Corrected".parse::<AdmissionRule>(), Ok(AdmissionRule::Corrected));
        assert!("strict".parse::<AdmissionRule>().is_err());
    }
}
