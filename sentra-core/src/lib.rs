use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod codec;
pub mod fsutil;

pub use codec::CodecError;

/// Account identities are printable strings (bs58 public-key hashes for
/// wallet-backed accounts, free-form labels in tests).
pub type Address = String;
pub type Hash32 = [u8; 32];

pub const BLOCK_VERSION: u32 = 1;
pub const MEMO_MAX_BYTES: usize = 256;
pub const MAX_TX_OUTPUTS: usize = 64;

pub const ZERO_HASH: Hash32 = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub to: Address,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Empty for coinbase transactions.
    pub sender: Address,
    pub outputs: Vec<TxOutput>,
    pub fee: u64,
    pub memo: Option<String>,
    pub timestamp: u64,
    /// Per-sender monotonic; for coinbase this carries the block height so
    /// that every coinbase hashes uniquely.
    pub nonce: u64,
    /// Opaque; validated by an injected verifier.
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn coinbase(miner: &str, amount: u64, timestamp: u64, height: u64) -> Self {
        Self {
            sender: String::new(),
            outputs: vec![TxOutput {
                to: miner.to_string(),
                amount,
            }],
            fee: 0,
            memo: None,
            timestamp,
            nonce: height,
            signature: Vec::new(),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn id(&self) -> Hash32 {
        blake3_hash(&codec::encode_tx(self))
    }

    /// Canonical bytes a signer commits to: the transaction with the
    /// signature field cleared.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        codec::encode_tx(&unsigned)
    }

    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    pub fn encoded_size(&self) -> u64 {
        codec::encode_tx(self).len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash32,
    pub merkle_root: Hash32,
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
}

impl BlockHeader {
    /// SHA-256 over the canonical 88-byte header encoding.
    pub fn hash(&self) -> Hash32 {
        sha256(&codec::encode_header(self))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash32 {
        self.header.hash()
    }

    pub fn compute_merkle_root(&self) -> Hash32 {
        let ids: Vec<Hash32> = self.transactions.iter().map(|tx| tx.id()).collect();
        merkle_root(&ids)
    }
}

/// Binary merkle tree over transaction ids; an odd node is paired with
/// itself. Empty input commits to the zero hash.
pub fn merkle_root(ids: &[Hash32]) -> Hash32 {
    if ids.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash32> = ids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&pair[0]);
            hasher.update(if pair.len() == 2 { &pair[1] } else { &pair[0] });
            next.push(*hasher.finalize().as_bytes());
        }
        level = next;
    }
    level[0]
}

pub fn sha256(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn blake3_hash(data: &[u8]) -> Hash32 {
    *blake3::hash(data).as_bytes()
}

pub fn hex32(hash: &Hash32) -> String {
    hex::encode(hash)
}

pub fn from_hex32(s: &str) -> Result<Hash32, ChainError> {
    let bytes = hex::decode(s).map_err(|e| ChainError::Validation(format!("bad hex: {e}")))?;
    let arr: Hash32 = bytes
        .try_into()
        .map_err(|_| ChainError::Validation("hash must be 32 bytes".into()))?;
    Ok(arr)
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("policy denied: {}", reasons.join(", "))]
    PolicyDenied {
        reasons: Vec<String>,
        suggestions: Vec<String>,
    },
    #[error("insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("consensus: {0}")]
    Consensus(String),
    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("ledger corruption at seq {seq} (byte offset {offset}): {detail}")]
    LedgerCorruption {
        seq: u64,
        offset: u64,
        detail: String,
    },
}

impl ChainError {
    /// Stable machine-readable kind carried across the API boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            ChainError::Validation(_) => "validation_error",
            ChainError::PolicyDenied { .. } => "policy_denied",
            ChainError::InsufficientFunds { .. } => "insufficient_funds",
            ChainError::Conflict(_) => "conflict_error",
            ChainError::Consensus(_) => "consensus_error",
            ChainError::Storage(_) => "storage_error",
            ChainError::Codec(_) => "validation_error",
            ChainError::LedgerCorruption { .. } => "ledger_corruption",
        }
    }
}
