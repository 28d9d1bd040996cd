//! Chain engine: admission, block production, validation, and state.
//!
//! Single-writer, multi-reader: every mutation runs under one
//! `parking_lot::RwLock` write guard; balance and chain reads share the
//! lock. PoW search owns nothing but a cancellation flag, and signal
//! fetching always happens before the lock is taken.

use parking_lot::RwLock;
use sentra_core::codec::{decode_block, encode_block};
use sentra_core::fsutil::atomic_write;
use sentra_core::{
    hex32, now_ts, Address, Block, BlockHeader, ChainError, Hash32, Transaction, BLOCK_VERSION,
    MAX_TX_OUTPUTS, MEMO_MAX_BYTES, ZERO_HASH,
};
use sentra_crypto::TxVerifier;
use sentra_ledger::{EntryDraft, LedgerEntry, LedgerError, RewardsLedger, VerifyReport};
use sentra_policy::{decisions_digest, BurstTracker, DecisionEnvelope, Guardian, PolicyDecision};
use sentra_signals::{CachedSource, SignalSnapshot};
use sentra_tokenomics::{Bucket, EmissionState, SubsidyParams, TokenomicsEngine, TokenomicsError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

pub mod mempool;
pub mod pow;

use mempool::Mempool;

pub const DEFAULT_RETARGET_INTERVAL: u64 = 10;
pub const DEFAULT_MAX_BLOCK_WEIGHT: u64 = 100_000;
pub const DEFAULT_MEMPOOL_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub subsidy: SubsidyParams,
    pub genesis_ts: u64,
    pub initial_bits: u32,
    pub retarget_interval: u64,
    pub max_block_weight: u64,
    pub mempool_max_entries: usize,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            subsidy: SubsidyParams::default(),
            genesis_ts: 1_700_000_000,
            initial_bits: pow::MAX_TARGET_BITS,
            retarget_interval: DEFAULT_RETARGET_INTERVAL,
            max_block_weight: DEFAULT_MAX_BLOCK_WEIGHT,
            mempool_max_entries: DEFAULT_MEMPOOL_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone)]
struct Summary {
    height: u64,
    hash: Hash32,
    prev_hash: Hash32,
    timestamp: u64,
    bits: u32,
    tx_count: u64,
    coinbase_out: u64,
}

/// Read-model row for `tip`/`range`/`chain_tail`.
#[derive(Debug, Clone, Serialize)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: u64,
    pub bits: u32,
    pub tx_count: u64,
    pub coinbase_out: u64,
}

impl From<&Summary> for BlockSummary {
    fn from(s: &Summary) -> Self {
        Self {
            height: s.height,
            hash: hex32(&s.hash),
            prev_hash: hex32(&s.prev_hash),
            timestamp: s.timestamp,
            bits: s.bits,
            tx_count: s.tx_count,
            coinbase_out: s.coinbase_out,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReceipt {
    pub txid: String,
    pub decision: DecisionEnvelope,
}

/// A candidate block plus the immutable issuance context captured when it
/// was assembled. The snapshot rides through PoW untouched, so a retarget
/// or a later signal fetch cannot change the subsidy mid-mine.
#[derive(Debug, Clone)]
pub struct Template {
    pub block: Block,
    pub snapshot: SignalSnapshot,
    pub subsidy: u64,
    pub fees_total: u64,
    pub decisions_digest: Hash32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    tip_height: u64,
    tip_hash: String,
    balances: BTreeMap<String, u64>,
    nonces: BTreeMap<String, u64>,
}

struct ChainInner {
    summaries: Vec<Summary>,
    balances: HashMap<Address, u64>,
    nonces: HashMap<Address, u64>,
    pool: Mempool,
    burst: BurstTracker,
    tokenomics: TokenomicsEngine,
    ledger: RewardsLedger,
    mining_halted: bool,
}

impl ChainInner {
    fn tip(&self) -> &Summary {
        self.summaries.last().expect("genesis block always present")
    }
}

pub struct ChainHandle {
    datadir: PathBuf,
    params: ChainParams,
    guardian: Guardian,
    verifier: Arc<dyn TxVerifier>,
    signals: CachedSource,
    inner: RwLock<ChainInner>,
}

fn ledger_err(err: LedgerError) -> ChainError {
    match err {
        LedgerError::Io(io) => ChainError::Storage(io),
        LedgerError::Corrupt { seq, offset, detail } => {
            ChainError::LedgerCorruption { seq, offset, detail }
        }
    }
}

fn token_err(err: TokenomicsError) -> ChainError {
    match err {
        TokenomicsError::Io(io) => ChainError::Storage(io),
        TokenomicsError::Malformed(detail) => {
            ChainError::Consensus(format!("emission state malformed: {detail}"))
        }
    }
}

fn mul_ppt(fee: u64, multiplier_ppt: u64) -> u64 {
    (fee as u128 * multiplier_ppt as u128 / 1_000) as u64
}

fn block_file(datadir: &Path, height: u64) -> PathBuf {
    datadir.join("blocks").join(format!("{height:06}.blk"))
}

fn genesis_block(params: &ChainParams) -> Block {
    Block {
        height: 0,
        header: BlockHeader {
            version: BLOCK_VERSION,
            prev_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            timestamp: params.genesis_ts,
            bits: params.initial_bits,
            nonce: 0,
        },
        transactions: Vec::new(),
    }
}

fn summary_of(block: &Block) -> Summary {
    let coinbase_out = block
        .transactions
        .first()
        .filter(|tx| tx.is_coinbase())
        .and_then(|tx| tx.total_output())
        .unwrap_or(0);
    Summary {
        height: block.height,
        hash: block.hash(),
        prev_hash: block.header.prev_hash,
        timestamp: block.header.timestamp,
        bits: block.header.bits,
        tx_count: block.transactions.len() as u64,
        coinbase_out,
    }
}

fn validate_shape(tx: &Transaction) -> Result<(), ChainError> {
    if tx.sender.is_empty() {
        return Err(ChainError::Validation("sender must not be empty".into()));
    }
    if tx.outputs.is_empty() || tx.outputs.len() > MAX_TX_OUTPUTS {
        return Err(ChainError::Validation(format!(
            "output count must be 1..={MAX_TX_OUTPUTS}"
        )));
    }
    if tx.outputs.iter().any(|out| out.to.is_empty()) {
        return Err(ChainError::Validation(
            "output address must not be empty".into(),
        ));
    }
    if let Some(memo) = &tx.memo {
        if memo.len() > MEMO_MAX_BYTES {
            return Err(ChainError::Validation(format!(
                "memo exceeds {MEMO_MAX_BYTES} bytes"
            )));
        }
    }
    let total = tx
        .total_output()
        .ok_or_else(|| ChainError::Validation("output amounts overflow".into()))?;
    total
        .checked_add(tx.fee)
        .ok_or_else(|| ChainError::Validation("amount plus fee overflows".into()))?;
    Ok(())
}

/// Applies a block's transactions to the given state maps, re-deriving each
/// effective fee from the chain-visible burst context. Used both when
/// validating an append (on staged copies) and when replaying block files
/// at startup, so the two paths cannot diverge.
fn apply_block_effects(
    guardian: &Guardian,
    verifier: &dyn TxVerifier,
    burst: &mut BurstTracker,
    balances: &mut HashMap<Address, u64>,
    nonces: &mut HashMap<Address, u64>,
    block: &Block,
) -> Result<(u64, u64), ChainError> {
    let coinbase = block
        .transactions
        .first()
        .filter(|tx| tx.is_coinbase())
        .ok_or_else(|| ChainError::Consensus("first transaction must be coinbase".into()))?;
    if coinbase.outputs.len() != 1 || coinbase.fee != 0 || coinbase.nonce != block.height {
        return Err(ChainError::Consensus("malformed coinbase".into()));
    }
    if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err(ChainError::Consensus("more than one coinbase".into()));
    }

    let mut fees_total = 0u64;
    for tx in block.transactions.iter().skip(1) {
        validate_shape(tx)?;
        if !verifier.verify(tx) {
            return Err(ChainError::Consensus(format!(
                "signature verification failed for ({}, nonce {})",
                tx.sender, tx.nonce
            )));
        }
        let expected = nonces.get(&tx.sender).copied().unwrap_or(0) + 1;
        if tx.nonce != expected {
            return Err(ChainError::Consensus(format!(
                "nonce {} out of order for {} (expected {expected})",
                tx.nonce, tx.sender
            )));
        }
        let ctx = burst.context_for(&tx.sender, tx.timestamp);
        let decision = guardian.score_tx(tx, &ctx);
        if !decision.allowed() {
            return Err(ChainError::Consensus(format!(
                "transaction ({}, nonce {}) fails policy admission",
                tx.sender, tx.nonce
            )));
        }
        let effective_fee = mul_ppt(tx.fee, decision.fee_multiplier_ppt);
        let total_out = tx
            .total_output()
            .ok_or_else(|| ChainError::Consensus("output overflow".into()))?;
        let debit = total_out
            .checked_add(effective_fee)
            .ok_or_else(|| ChainError::Consensus("debit overflow".into()))?;
        let balance = balances.get(&tx.sender).copied().unwrap_or(0);
        let remaining = balance.checked_sub(debit).ok_or(ChainError::InsufficientFunds {
            needed: debit,
            available: balance,
        })?;
        balances.insert(tx.sender.clone(), remaining);
        for out in &tx.outputs {
            let entry = balances.entry(out.to.clone()).or_insert(0);
            *entry = entry
                .checked_add(out.amount)
                .ok_or_else(|| ChainError::Consensus("balance overflow".into()))?;
        }
        nonces.insert(tx.sender.clone(), tx.nonce);
        burst.observe(&tx.sender, tx.timestamp);
        fees_total = fees_total.saturating_add(effective_fee);
    }

    let coinbase_out = coinbase
        .total_output()
        .ok_or_else(|| ChainError::Consensus("coinbase overflow".into()))?;
    let miner = &coinbase.outputs[0].to;
    let entry = balances.entry(miner.clone()).or_insert(0);
    *entry = entry
        .checked_add(coinbase_out)
        .ok_or_else(|| ChainError::Consensus("balance overflow".into()))?;
    Ok((fees_total, coinbase_out))
}

impl ChainHandle {
    pub fn open(
        datadir: &Path,
        params: ChainParams,
        verifier: Arc<dyn TxVerifier>,
        signals: CachedSource,
    ) -> Result<Self, ChainError> {
        std::fs::create_dir_all(datadir.join("blocks"))?;
        let guardian = Guardian::new();

        let genesis_path = block_file(datadir, 0);
        if !genesis_path.exists() {
            let genesis = genesis_block(&params);
            atomic_write(&genesis_path, &encode_block(&genesis))?;
            info!(datadir = %datadir.display(), "initialized chain with genesis block");
        }

        // Rebuild state by replaying block files; state.json and
        // mempool.json are mirrors, never sources.
        let mut summaries = Vec::new();
        let mut balances = HashMap::new();
        let mut nonces = HashMap::new();
        let mut burst = BurstTracker::new();
        let mut replay_minted = 0u64;
        let mut height = 0u64;
        loop {
            let path = block_file(datadir, height);
            if !path.exists() {
                break;
            }
            let bytes = std::fs::read(&path)?;
            let block = decode_block(&bytes, height)?;
            if height > 0 {
                let (fees_total, coinbase_out) = apply_block_effects(
                    &guardian,
                    verifier.as_ref(),
                    &mut burst,
                    &mut balances,
                    &mut nonces,
                    &block,
                )?;
                replay_minted = replay_minted.saturating_add(coinbase_out.saturating_sub(fees_total));
            }
            summaries.push(summary_of(&block));
            height += 1;
        }

        let tokenomics = TokenomicsEngine::open(datadir, params.subsidy.clone(), params.genesis_ts)
            .map_err(token_err)?;
        if tokenomics.state().minted_total != replay_minted {
            warn!(
                recorded = tokenomics.state().minted_total,
                replayed = replay_minted,
                "emission state and block replay disagree on minted total"
            );
        }
        let ledger =
            RewardsLedger::open(&datadir.join("rewards_ledger.jsonl")).map_err(ledger_err)?;
        let pool = Mempool::new(params.mempool_max_entries);

        let handle = Self {
            datadir: datadir.to_path_buf(),
            params,
            guardian,
            verifier,
            signals,
            inner: RwLock::new(ChainInner {
                summaries,
                balances,
                nonces,
                pool,
                burst,
                tokenomics,
                ledger,
                mining_halted: false,
            }),
        };
        handle.write_state_mirror(&handle.inner.read())?;
        Ok(handle)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Admission: shape, signature, nonce uniqueness, policy, spendable
    /// balance net of pending debits, then pool insertion. Serialized under
    /// the writer lock so the admission order is total.
    pub fn submit_tx(&self, tx: Transaction) -> Result<AdmissionReceipt, ChainError> {
        validate_shape(&tx)?;
        if tx.is_coinbase() {
            return Err(ChainError::Validation(
                "coinbase transactions cannot be submitted".into(),
            ));
        }
        if !self.verifier.verify(&tx) {
            return Err(ChainError::Validation("signature verification failed".into()));
        }

        let mut inner = self.inner.write();
        let last_accepted = inner.nonces.get(&tx.sender).copied().unwrap_or(0);
        if tx.nonce <= last_accepted {
            return Err(ChainError::Conflict(format!(
                "nonce {} already accepted for {}",
                tx.nonce, tx.sender
            )));
        }
        if inner.pool.contains(&tx.sender, tx.nonce) {
            return Err(ChainError::Conflict(format!(
                "transaction ({}, nonce {}) already pending",
                tx.sender, tx.nonce
            )));
        }

        let ctx = inner.burst.context_for(&tx.sender, tx.timestamp);
        let decision = self.guardian.score_tx(&tx, &ctx);
        if !decision.allowed() {
            return Err(ChainError::PolicyDenied {
                reasons: decision.reasons,
                suggestions: decision.suggestions,
            });
        }
        let effective_fee = mul_ppt(tx.fee, decision.fee_multiplier_ppt);
        let total_out = tx
            .total_output()
            .ok_or_else(|| ChainError::Validation("output amounts overflow".into()))?;
        let needed = total_out.saturating_add(effective_fee);
        let balance = inner.balances.get(&tx.sender).copied().unwrap_or(0);
        let pending = inner.pool.pending_debit(&tx.sender);
        let available = balance.saturating_sub(pending);
        if available < needed {
            return Err(ChainError::InsufficientFunds { needed, available });
        }

        let txid = tx.id();
        let envelope = decision.envelope();
        inner.pool.insert(tx, decision, effective_fee)?;
        self.write_mempool_mirror(&inner);
        Ok(AdmissionReceipt {
            txid: hex32(&txid),
            decision: envelope,
        })
    }

    /// Compact bits for the next block: carried forward between retarget
    /// boundaries, recomputed from the median spacing of the closed window
    /// at each boundary.
    fn next_bits(&self, inner: &ChainInner) -> u32 {
        let tip = inner.tip();
        let next_height = tip.height + 1;
        let interval = self.params.retarget_interval;
        if interval == 0 || next_height % interval != 0 {
            return tip.bits;
        }
        if inner.summaries.len() < 2 {
            return tip.bits;
        }
        let take = (interval as usize + 1).min(inner.summaries.len());
        let tail = &inner.summaries[inner.summaries.len() - take..];
        let spacings: Vec<u64> = tail
            .windows(2)
            .map(|pair| pair[1].timestamp.saturating_sub(pair[0].timestamp))
            .collect();
        pow::retarget(
            tip.bits,
            &spacings,
            self.params.subsidy.target_block_time_secs,
        )
    }

    /// Assembles a candidate block: signal snapshot first (outside any
    /// lock), then greedy fee-rate selection under a read guard.
    pub fn build_block_template(&self, miner: &str) -> Result<Template, ChainError> {
        if miner.is_empty() {
            return Err(ChainError::Validation("miner address must not be empty".into()));
        }
        let snapshot = self.signals.snapshot();

        let inner = self.inner.read();
        if inner.mining_halted {
            return Err(ChainError::Consensus(
                "mining halted: rewards ledger needs operator attention".into(),
            ));
        }
        let tip = inner.tip();
        let height = tip.height + 1;
        let bits = self.next_bits(&inner);
        let timestamp = now_ts().max(tip.timestamp + 1);

        let coinbase_reserve = Transaction::coinbase(miner, u64::MAX, timestamp, height)
            .encoded_size();
        let mut weight = coinbase_reserve;
        let mut scratch_burst = inner.burst.clone();
        let mut extra_debits: HashMap<Address, u64> = HashMap::new();
        let mut next_nonce: HashMap<Address, u64> = HashMap::new();
        let mut selected: Vec<Transaction> = Vec::new();
        let mut admission_decisions: Vec<(Hash32, PolicyDecision)> = Vec::new();
        let mut fees_total = 0u64;

        for pooled in inner.pool.priority_order() {
            let tx = &pooled.tx;
            if weight + pooled.size > self.params.max_block_weight {
                continue;
            }
            let expected = next_nonce
                .get(&tx.sender)
                .copied()
                .unwrap_or_else(|| inner.nonces.get(&tx.sender).copied().unwrap_or(0) + 1);
            if tx.nonce != expected {
                // Single greedy pass; gapped nonces wait for a later block.
                continue;
            }
            let ctx = scratch_burst.context_for(&tx.sender, tx.timestamp);
            let decision = self.guardian.score_tx(tx, &ctx);
            if !decision.allowed() {
                continue;
            }
            let effective_fee = mul_ppt(tx.fee, decision.fee_multiplier_ppt);
            let total_out = match tx.total_output() {
                Some(total) => total,
                None => continue,
            };
            let debit = total_out.saturating_add(effective_fee);
            let balance = inner.balances.get(&tx.sender).copied().unwrap_or(0);
            let already = extra_debits.get(&tx.sender).copied().unwrap_or(0);
            if balance.saturating_sub(already) < debit {
                continue;
            }
            extra_debits.insert(tx.sender.clone(), already + debit);
            next_nonce.insert(tx.sender.clone(), tx.nonce + 1);
            scratch_burst.observe(&tx.sender, tx.timestamp);
            weight += pooled.size;
            fees_total = fees_total.saturating_add(effective_fee);
            admission_decisions.push((tx.id(), pooled.decision.clone()));
            selected.push(tx.clone());
        }

        let subsidy = inner.tokenomics.subsidy_for(height, &snapshot);
        let coinbase = Transaction::coinbase(miner, subsidy + fees_total, timestamp, height);
        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(coinbase);
        transactions.extend(selected);

        let decision_refs: Vec<(Hash32, &PolicyDecision)> = admission_decisions
            .iter()
            .map(|(id, d)| (*id, d))
            .collect();
        let digest = decisions_digest(&decision_refs);

        let mut block = Block {
            height,
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_hash: tip.hash,
                merkle_root: ZERO_HASH,
                timestamp,
                bits,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();

        Ok(Template {
            block,
            snapshot,
            subsidy,
            fees_total,
            decisions_digest: digest,
        })
    }

    /// PoW search over the template. Holds no lock; cancellation is checked
    /// at a bounded nonce stride.
    pub fn mine(&self, template: &Template, cancel: &AtomicBool) -> Result<Block, ChainError> {
        let mut block = template.block.clone();
        if !pow::solve(&mut block.header, cancel) {
            return Err(ChainError::Conflict(
                "mining cancelled before a solution was found".into(),
            ));
        }
        Ok(block)
    }

    /// Validates and appends a solved block. All-or-nothing: effects are
    /// staged on copies, the block file is written atomically, and only
    /// then does in-memory state move. The ledger entry is written last,
    /// after the block and emission state are durable.
    pub fn append_block(&self, block: &Block, template: &Template) -> Result<BlockSummary, ChainError> {
        let mut inner = self.inner.write();
        if inner.mining_halted {
            return Err(ChainError::Consensus(
                "mining halted: rewards ledger needs operator attention".into(),
            ));
        }
        let tip = inner.tip().clone();
        if block.height != tip.height + 1 {
            return Err(ChainError::Consensus(format!(
                "height {} does not extend tip {}",
                block.height, tip.height
            )));
        }
        if block.header.prev_hash != tip.hash {
            return Err(ChainError::Consensus("prev_hash does not match tip".into()));
        }
        let expected_bits = self.next_bits(&inner);
        if block.header.bits != expected_bits {
            return Err(ChainError::Consensus(format!(
                "bits {:#010x} do not match expected {:#010x}",
                block.header.bits, expected_bits
            )));
        }
        if block.header.merkle_root != block.compute_merkle_root() {
            return Err(ChainError::Consensus("merkle root mismatch".into()));
        }
        if !pow::hash_meets_target(&block.hash(), block.header.bits) {
            return Err(ChainError::Consensus("header hash exceeds target".into()));
        }

        let mut balances = inner.balances.clone();
        let mut nonces = inner.nonces.clone();
        let mut burst = inner.burst.clone();
        let (fees_total, coinbase_out) = apply_block_effects(
            &self.guardian,
            self.verifier.as_ref(),
            &mut burst,
            &mut balances,
            &mut nonces,
            block,
        )?;

        let subsidy_allowed = inner.tokenomics.subsidy_for(block.height, &template.snapshot);
        let ceiling = subsidy_allowed.saturating_add(fees_total);
        if coinbase_out > ceiling {
            return Err(ChainError::Consensus(format!(
                "coinbase pays {coinbase_out}, allowed at most {ceiling}"
            )));
        }
        let minted = coinbase_out.saturating_sub(fees_total);
        let total_supply = self.params.subsidy.total_supply;
        if inner.tokenomics.state().minted_total.saturating_add(minted) > total_supply {
            return Err(ChainError::Consensus("total supply would be exceeded".into()));
        }

        // Stage the block file, then commit.
        atomic_write(&block_file(&self.datadir, block.height), &encode_block(block))?;

        let summary = summary_of(block);
        inner.balances = balances;
        inner.nonces = nonces;
        inner.burst = burst;
        inner.summaries.push(summary.clone());
        inner.pool.remove_included(&block.transactions);
        self.write_state_mirror(&inner)?;
        self.write_mempool_mirror(&inner);

        if let Err(err) = inner.tokenomics.apply(minted, block.header.timestamp) {
            inner.mining_halted = true;
            return Err(token_err(err));
        }

        let miner = block
            .transactions
            .first()
            .and_then(|cb| cb.outputs.first())
            .map(|out| out.to.clone())
            .unwrap_or_default();
        let draft = EntryDraft {
            block_height: block.height,
            miner,
            subsidy: minted,
            fees_total,
            signals_digest: template.snapshot.digest(),
            policy_decisions_digest: template.decisions_digest,
            timestamp: block.header.timestamp,
        };
        if let Err(err) = inner.ledger.append(draft) {
            inner.mining_halted = true;
            return Err(ledger_err(err));
        }

        info!(
            height = block.height,
            txs = block.transactions.len(),
            subsidy = minted,
            fees = fees_total,
            "block appended"
        );
        Ok(BlockSummary::from(&summary))
    }

    /// Template, PoW, append in one call; the convenience path front-ends
    /// use for `mine`.
    pub fn mine_next(&self, miner: &str, cancel: &AtomicBool) -> Result<BlockSummary, ChainError> {
        let template = self.build_block_template(miner)?;
        let block = self.mine(&template, cancel)?;
        self.append_block(&block, &template)
    }

    pub fn balance(&self, addr: &str) -> u64 {
        self.inner.read().balances.get(addr).copied().unwrap_or(0)
    }

    /// Last accepted nonce for a sender; zero if the account never sent.
    pub fn account_nonce(&self, addr: &str) -> u64 {
        self.inner.read().nonces.get(addr).copied().unwrap_or(0)
    }

    pub fn tip(&self) -> BlockSummary {
        self.inner.read().tip().into()
    }

    pub fn range(&self, from: u64, n: usize) -> Vec<BlockSummary> {
        let inner = self.inner.read();
        inner
            .summaries
            .iter()
            .skip(from as usize)
            .take(n)
            .map(BlockSummary::from)
            .collect()
    }

    pub fn chain_tail(&self, n: usize) -> Vec<BlockSummary> {
        let inner = self.inner.read();
        let start = inner.summaries.len().saturating_sub(n);
        inner.summaries[start..].iter().map(BlockSummary::from).collect()
    }

    pub fn mempool_len(&self) -> usize {
        self.inner.read().pool.len()
    }

    /// Full ledger audit. A clean report re-arms mining; a divergence
    /// halts it until an operator intervenes.
    pub fn verify_ledger(&self) -> Result<VerifyReport, ChainError> {
        let mut inner = self.inner.write();
        let report = inner.ledger.verify().map_err(ledger_err)?;
        inner.mining_halted = !report.ok;
        if !report.ok {
            warn!(
                entries = report.entries,
                "rewards ledger verification failed; mining halted"
            );
        }
        Ok(report)
    }

    pub fn ledger_tail(&self, n: usize) -> Result<Vec<LedgerEntry>, ChainError> {
        self.inner.read().ledger.tail(n).map_err(ledger_err)
    }

    pub fn emission_state(&self) -> EmissionState {
        self.inner.read().tokenomics.state().clone()
    }

    pub fn vested(&self, bucket: Bucket, now: u64) -> u64 {
        self.inner.read().tokenomics.vested(bucket, now)
    }

    fn write_state_mirror(&self, inner: &ChainInner) -> Result<(), ChainError> {
        let tip = inner.tip();
        let state = StateFile {
            tip_height: tip.height,
            tip_hash: hex32(&tip.hash),
            balances: inner
                .balances
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            nonces: inner.nonces.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&state)
            .map_err(|e| ChainError::Storage(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        atomic_write(&self.datadir.join("state.json"), &bytes)?;
        Ok(())
    }

    fn write_mempool_mirror(&self, inner: &ChainInner) {
        let snapshot = inner.pool.snapshot();
        if let Ok(bytes) = serde_json::to_vec_pretty(&snapshot) {
            if let Err(err) = atomic_write(&self.datadir.join("mempool.json"), &bytes) {
                warn!(error = %err, "failed to mirror mempool snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_crypto::AcceptAllVerifier;
    use sentra_core::TxOutput;
    use sentra_signals::StaticSource;
    use std::time::Duration;
    use tempfile::TempDir;

    fn zero_signals() -> CachedSource {
        CachedSource::new(
            Box::new(StaticSource::new(SignalSnapshot::zero())),
            Duration::from_secs(30),
        )
    }

    fn open_chain(dir: &TempDir) -> ChainHandle {
        ChainHandle::open(
            dir.path(),
            ChainParams::default(),
            Arc::new(AcceptAllVerifier),
            zero_signals(),
        )
        .unwrap()
    }

    fn transfer(sender: &str, to: &str, amount: u64, fee: u64, nonce: u64) -> Transaction {
        Transaction {
            sender: sender.into(),
            outputs: vec![TxOutput {
                to: to.into(),
                amount,
            }],
            fee,
            memo: None,
            timestamp: now_ts(),
            nonce,
            signature: Vec::new(),
        }
    }

    fn mine_blocks(chain: &ChainHandle, miner: &str, count: usize) {
        let cancel = AtomicBool::new(false);
        for _ in 0..count {
            chain.mine_next(miner, &cancel).unwrap();
        }
    }

    #[test]
    fn open_creates_genesis() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        let tip = chain.tip();
        assert_eq!(tip.height, 0);
        assert_eq!(tip.tx_count, 0);
        assert!(dir.path().join("blocks/000000.blk").exists());
        assert!(dir.path().join("state.json").exists());
    }

    #[test]
    fn first_mined_block_pays_dynamic_subsidy() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "miner_a", 1);
        assert_eq!(chain.balance("miner_a"), 19);
        assert_eq!(chain.emission_state().minted_total, 19);
        let entries = chain.ledger_tail(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[0].subsidy, 19);
    }

    #[test]
    fn admission_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "alice", 8); // 152 units
        let tx = transfer("alice", "bob", 50, 101, 1);
        chain.submit_tx(tx.clone()).unwrap();
        let err = chain.submit_tx(tx).unwrap_err();
        assert_eq!(err.kind(), "conflict_error");
        assert_eq!(chain.mempool_len(), 1);
    }

    #[test]
    fn admission_rejects_overspend_including_pending() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "alice", 8); // 152 units
        let err = chain
            .submit_tx(transfer("alice", "bob", 100, 500, 1))
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");
        chain.submit_tx(transfer("alice", "bob", 50, 101, 1)).unwrap();
        let err = chain
            .submit_tx(transfer("alice", "bob", 1, 101, 2))
            .unwrap_err();
        assert_eq!(err.kind(), "insufficient_funds");
    }

    #[test]
    fn policy_deny_surfaces_reasons() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "alice", 8);
        let mut tx = transfer("alice", "bob", 10, 0, 1);
        tx.outputs = (0..10)
            .map(|i| TxOutput {
                to: format!("out{i}"),
                amount: 1,
            })
            .collect();
        tx.memo = Some("FREE MONEY airdrop claim http://x".into());
        let err = chain.submit_tx(tx).unwrap_err();
        match err {
            ChainError::PolicyDenied { reasons, .. } => {
                assert!(reasons.iter().any(|r| r == "tx_denied_extreme_spam"));
            }
            other => panic!("expected PolicyDenied, got {other:?}"),
        }
    }

    #[test]
    fn warn_multiplier_charges_effective_fee() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "alice", 9); // 171 units
        // Two memo pattern hits (30) + low fee (15) = 45 -> warn x2, so the
        // 60-unit declared fee is charged as 120.
        let mut tx = transfer("alice", "bob", 50, 60, 1);
        tx.memo = Some("claim your airdrop".into());
        let receipt = chain.submit_tx(tx).unwrap();
        assert!(receipt.decision.ok);
        assert_eq!(receipt.decision.fee_multiplier, 2.0);

        mine_blocks(&chain, "miner_b", 1);
        assert_eq!(chain.balance("bob"), 50);
        // The excess over the declared fee is never refunded to the sender.
        assert_eq!(chain.balance("alice"), 171 - 50 - 120);
        assert_eq!(chain.balance("miner_b"), 19 + 120);
    }

    #[test]
    fn mined_block_includes_pending_transfer() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "alice", 8); // 152
        chain.submit_tx(transfer("alice", "bob", 40, 102, 1)).unwrap();
        mine_blocks(&chain, "miner_b", 1);
        assert_eq!(chain.balance("bob"), 40);
        assert_eq!(chain.balance("alice"), 152 - 142);
        assert_eq!(chain.balance("miner_b"), 19 + 102);
        assert_eq!(chain.mempool_len(), 0);
    }

    #[test]
    fn higher_fee_rate_orders_first_in_block() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "alice", 8);
        mine_blocks(&chain, "bob", 8);
        // Same size, same amount: B's fee rate (50) beats A's (10).
        chain.submit_tx(transfer("alice", "sink", 100, 10, 1)).unwrap();
        chain.submit_tx(transfer("bob", "sink", 100, 50, 1)).unwrap();
        let template = chain.build_block_template("miner_c").unwrap();
        let body = &template.block.transactions;
        assert!(body[0].is_coinbase());
        assert_eq!(body[1].sender, "bob");
        assert_eq!(body[2].sender, "alice");
    }

    #[test]
    fn append_rejects_tampered_block() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        let template = chain.build_block_template("miner_a").unwrap();
        let cancel = AtomicBool::new(false);
        let block = chain.mine(&template, &cancel).unwrap();

        let mut overpaid = block.clone();
        overpaid.transactions[0].outputs[0].amount += 1;
        overpaid.header.merkle_root = overpaid.compute_merkle_root();
        let err = chain.append_block(&overpaid, &template).unwrap_err();
        assert_eq!(err.kind(), "consensus_error");

        let mut bad_merkle = block.clone();
        bad_merkle.header.merkle_root = [5u8; 32];
        let err = chain.append_block(&bad_merkle, &template).unwrap_err();
        assert_eq!(err.kind(), "consensus_error");

        chain.append_block(&block, &template).unwrap();
        assert_eq!(chain.tip().height, 1);
    }

    #[test]
    fn state_survives_reopen_by_replay() {
        let dir = TempDir::new().unwrap();
        {
            let chain = open_chain(&dir);
            mine_blocks(&chain, "alice", 10); // 190 units
            chain.submit_tx(transfer("alice", "bob", 20, 150, 1)).unwrap();
            mine_blocks(&chain, "alice", 1);
        }
        let chain = open_chain(&dir);
        assert_eq!(chain.tip().height, 11);
        assert_eq!(chain.balance("bob"), 20);
        // Mempool is rebuilt empty on restart.
        assert_eq!(chain.mempool_len(), 0);
        // Conservation: sum of balances equals minted total.
        let minted = chain.emission_state().minted_total;
        assert_eq!(minted, 11 * 19);
        let total: u64 = chain.balance("alice") + chain.balance("bob");
        assert_eq!(total, minted);
    }

    #[test]
    fn ledger_tamper_halts_mining_until_reverified() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "alice", 2);
        let ledger_path = dir.path().join("rewards_ledger.jsonl");
        let content = std::fs::read_to_string(&ledger_path).unwrap();
        std::fs::write(&ledger_path, content.replacen("alice", "mallory", 1)).unwrap();

        let report = chain.verify_ledger().unwrap();
        assert!(!report.ok);
        let cancel = AtomicBool::new(false);
        let err = chain.mine_next("alice", &cancel).unwrap_err();
        assert_eq!(err.kind(), "consensus_error");

        // Operator restores the file; verification re-arms mining.
        std::fs::write(&ledger_path, content).unwrap();
        assert!(chain.verify_ledger().unwrap().ok);
        chain.mine_next("alice", &cancel).unwrap();
    }

    #[test]
    fn subsidy_uses_template_snapshot_pressure() {
        let dir = TempDir::new().unwrap();
        let mut snap = SignalSnapshot::zero();
        snap.fee_fast = 100;
        snap.captured_at = 1;
        let chain = ChainHandle::open(
            dir.path(),
            ChainParams::default(),
            Arc::new(AcceptAllVerifier),
            CachedSource::new(Box::new(StaticSource::new(snap)), Duration::from_secs(30)),
        )
        .unwrap();
        let cancel = AtomicBool::new(false);
        chain.mine_next("miner_a", &cancel).unwrap();
        // floor(19 * 1.5) under fee pressure 2.0
        assert_eq!(chain.balance("miner_a"), 28);
    }

    #[test]
    fn retarget_boundary_changes_bits_deterministically() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        mine_blocks(&chain, "alice", 10);
        // Height 10 closed the first retarget window; the next template
        // must carry whatever bits the window median implies, and both the
        // miner and the validator agree on it.
        let template = chain.build_block_template("alice").unwrap();
        let cancel = AtomicBool::new(false);
        let block = chain.mine(&template, &cancel).unwrap();
        let appended = chain.append_block(&block, &template).unwrap();
        assert_eq!(appended.height, 11);
        assert_eq!(appended.bits, template.block.header.bits);
    }
}
