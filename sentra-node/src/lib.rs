//! Node wiring: configuration to components, logging, and the operational
//! command surface front-ends consume.

use anyhow::Result;
use sentra_chain::{
    AdmissionReceipt, BlockSummary, ChainHandle, ChainParams,
};
use sentra_config::{ChainSection, SentraConfig};
use sentra_core::{ChainError, Transaction};
use sentra_crypto::{AcceptAllVerifier, Ed25519Verifier, TxVerifier};
use sentra_ledger::{LedgerEntry, VerifyReport};
use sentra_signals::{CachedSource, HttpSource, SignalSnapshot, SignalSource, StaticSource};
use sentra_tokenomics::{Bucket, EmissionState, SubsidyParams};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn chain_params(section: &ChainSection) -> ChainParams {
    ChainParams {
        subsidy: SubsidyParams {
            total_supply: section.total_supply,
            target_years: section.target_years,
            target_block_time_secs: section.target_block_time_secs,
            min_subsidy: section.min_subsidy,
            max_subsidy: section.max_subsidy,
            tail_emission: section.tail_emission,
        },
        genesis_ts: section.genesis_ts,
        initial_bits: section.initial_bits,
        retarget_interval: section.retarget_interval,
        max_block_weight: section.max_block_weight,
        mempool_max_entries: section.mempool_max_entries,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmissionStatus {
    pub state: EmissionState,
    pub epoch: u64,
    pub vested: BTreeMap<String, u64>,
}

pub struct Node {
    chain: ChainHandle,
    cancel: Arc<AtomicBool>,
}

impl Node {
    pub fn open(cfg: &SentraConfig) -> Result<Self> {
        let params = chain_params(&cfg.chain);
        let verifier: Arc<dyn TxVerifier> = if cfg.chain.signature_checks {
            Arc::new(Ed25519Verifier)
        } else {
            Arc::new(AcceptAllVerifier)
        };
        let source: Box<dyn SignalSource> = match cfg.signals.endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => Box::new(HttpSource::new(
                endpoint,
                Duration::from_secs(cfg.signals.fetch_timeout_secs),
            )?),
            _ => Box::new(StaticSource::new(SignalSnapshot::zero())),
        };
        let signals = CachedSource::new(source, Duration::from_secs(cfg.signals.ttl_secs));
        let chain = ChainHandle::open(&cfg.node.datadir, params, verifier, signals)?;
        info!(datadir = %cfg.node.datadir.display(), height = chain.tip().height, "node ready");
        Ok(Self {
            chain,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn chain(&self) -> &ChainHandle {
        &self.chain
    }

    /// Shared flag a front-end may set to stop an in-flight nonce search.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn submit_tx(&self, tx: Transaction) -> Result<AdmissionReceipt, ChainError> {
        self.chain.submit_tx(tx)
    }

    pub fn mine(&self, miner: &str) -> Result<BlockSummary, ChainError> {
        self.chain.mine_next(miner, &self.cancel)
    }

    pub fn balance(&self, addr: &str) -> u64 {
        self.chain.balance(addr)
    }

    pub fn account_nonce(&self, addr: &str) -> u64 {
        self.chain.account_nonce(addr)
    }

    pub fn chain_tail(&self, n: usize) -> Vec<BlockSummary> {
        self.chain.chain_tail(n)
    }

    pub fn verify_ledger(&self) -> Result<VerifyReport, ChainError> {
        self.chain.verify_ledger()
    }

    pub fn ledger_tail(&self, n: usize) -> Result<Vec<LedgerEntry>, ChainError> {
        self.chain.ledger_tail(n)
    }

    pub fn emission_status(&self, now_ts: u64) -> EmissionStatus {
        let state = self.chain.emission_state();
        let epoch = state.epoch(now_ts);
        let vested = Bucket::ALL
            .iter()
            .map(|bucket| (format!("{bucket:?}"), self.chain.vested(*bucket, now_ts)))
            .collect();
        EmissionStatus {
            state,
            epoch,
            vested,
        }
    }
}
