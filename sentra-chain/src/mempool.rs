//! Pending-transaction pool keyed by `(sender, nonce)`.
//!
//! Priority is effective fee per encoded byte, compared with integer
//! cross-multiplication so ordering never depends on float rounding. When
//! the pool is full the entry with the lowest fee rate is evicted, oldest
//! first among equals.

use sentra_core::{Address, ChainError, Transaction};
use sentra_policy::PolicyDecision;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PooledTx {
    pub tx: Transaction,
    pub decision: PolicyDecision,
    pub effective_fee: u64,
    pub size: u64,
    /// Insertion sequence; total admission order.
    pub seq: u64,
}

impl PooledTx {
    pub fn debit(&self) -> u64 {
        self.tx
            .total_output()
            .unwrap_or(u64::MAX)
            .saturating_add(self.effective_fee)
    }
}

/// Best-first ordering: higher `effective_fee / size` wins; ties go to the
/// earlier insertion.
pub fn priority_cmp(a: &PooledTx, b: &PooledTx) -> Ordering {
    let left = a.effective_fee as u128 * b.size.max(1) as u128;
    let right = b.effective_fee as u128 * a.size.max(1) as u128;
    right.cmp(&left).then(a.seq.cmp(&b.seq))
}

/// Worst-first ordering used for eviction: lowest fee rate, oldest among
/// equals.
fn eviction_cmp(a: &PooledTx, b: &PooledTx) -> Ordering {
    let left = a.effective_fee as u128 * b.size.max(1) as u128;
    let right = b.effective_fee as u128 * a.size.max(1) as u128;
    left.cmp(&right).then(a.seq.cmp(&b.seq))
}

#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<(Address, u64), PooledTx>,
    next_seq: u64,
    max_entries: usize,
}

/// Best-effort on-disk snapshot shape; never loaded back, the pool is
/// rebuilt empty on restart.
#[derive(Debug, Serialize)]
pub struct MempoolSnapshot<'a> {
    pub entries: Vec<&'a Transaction>,
}

impl Mempool {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|p| p.size).sum()
    }

    pub fn contains(&self, sender: &str, nonce: u64) -> bool {
        self.entries.contains_key(&(sender.to_string(), nonce))
    }

    /// Sum of outputs plus effective fees already pending for a sender.
    pub fn pending_debit(&self, sender: &str) -> u64 {
        self.entries
            .values()
            .filter(|p| p.tx.sender == sender)
            .fold(0u64, |acc, p| acc.saturating_add(p.debit()))
    }

    pub fn insert(
        &mut self,
        tx: Transaction,
        decision: PolicyDecision,
        effective_fee: u64,
    ) -> Result<(), ChainError> {
        let key = (tx.sender.clone(), tx.nonce);
        if self.entries.contains_key(&key) {
            return Err(ChainError::Conflict(format!(
                "transaction ({}, nonce {}) already pending",
                key.0, key.1
            )));
        }
        let pooled = PooledTx {
            size: tx.encoded_size(),
            tx,
            decision,
            effective_fee,
            seq: self.next_seq,
        };
        if self.entries.len() >= self.max_entries {
            let worst_key = self
                .entries
                .iter()
                .min_by(|(_, a), (_, b)| eviction_cmp(a, b))
                .map(|(k, _)| k.clone());
            match worst_key {
                Some(worst_key) => {
                    let worst = &self.entries[&worst_key];
                    if priority_cmp(&pooled, worst) != Ordering::Less {
                        return Err(ChainError::Conflict(
                            "mempool full and fee rate does not beat the worst entry".into(),
                        ));
                    }
                    self.entries.remove(&worst_key);
                }
                None => {
                    return Err(ChainError::Conflict("mempool full".into()));
                }
            }
        }
        self.next_seq += 1;
        self.entries.insert(key, pooled);
        Ok(())
    }

    pub fn remove(&mut self, sender: &str, nonce: u64) -> Option<PooledTx> {
        self.entries.remove(&(sender.to_string(), nonce))
    }

    pub fn remove_included(&mut self, txs: &[Transaction]) {
        for tx in txs {
            if !tx.is_coinbase() {
                self.entries.remove(&(tx.sender.clone(), tx.nonce));
            }
        }
    }

    /// All entries, best first.
    pub fn priority_order(&self) -> Vec<&PooledTx> {
        let mut ordered: Vec<&PooledTx> = self.entries.values().collect();
        ordered.sort_by(|a, b| priority_cmp(a, b));
        ordered
    }

    pub fn snapshot(&self) -> MempoolSnapshot<'_> {
        let mut ordered: Vec<&PooledTx> = self.entries.values().collect();
        ordered.sort_by_key(|p| p.seq);
        MempoolSnapshot {
            entries: ordered.into_iter().map(|p| &p.tx).collect(),
        }
    }
}
