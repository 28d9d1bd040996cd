//! Fixed-supply, bucket-vested, epoch-paced emission engine.
//!
//! The consensus subsidy is pure integer arithmetic: pressure and the
//! multiplier are carried in parts-per-thousand and the final product is
//! floored, so every platform computes the identical reward for the same
//! `(height, minted_total, snapshot)` triple.

use sentra_core::fsutil::atomic_write;
use sentra_signals::SignalSnapshot;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub mod forecast;

// =============================================================================
// CHAIN PARAMETERS - SINGLE SOURCE OF TRUTH
// =============================================================================

/// Hard supply cap across every allocation bucket.
pub const TOTAL_SUPPLY: u64 = 100_000_000;

/// Community + Market portion issued algorithmically via block subsidies.
pub const EMISSION_POOL_TOTAL: u64 = 55_000_000;

pub const MIN_SUBSIDY: u64 = 1;
pub const MAX_SUBSIDY: u64 = 5_000;

/// 365 x 24 x 3600.
pub const SECONDS_PER_YEAR: u64 = 31_536_000;

/// Vesting months are 30 days.
pub const MONTH_SECS: u64 = 2_592_000;

pub const DEFAULT_TARGET_YEARS: u64 = 10;
pub const DEFAULT_TARGET_BLOCK_TIME_SECS: u64 = 60;
pub const DEFAULT_EPOCH_LENGTH_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bucket {
    Community,
    Team,
    Treasury,
    Founder,
    Market,
    Liquidity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vesting {
    /// Fully available at genesis.
    Immediate,
    /// Nothing before the cliff, then linear over the given span.
    CliffLinear { cliff_months: u64, linear_months: u64 },
    /// Sourced from block subsidies, not vesting math.
    Emission,
}

impl Bucket {
    pub const ALL: [Bucket; 6] = [
        Bucket::Community,
        Bucket::Team,
        Bucket::Treasury,
        Bucket::Founder,
        Bucket::Market,
        Bucket::Liquidity,
    ];

    pub fn total(self) -> u64 {
        match self {
            Bucket::Community => 45_000_000,
            Bucket::Team => 15_000_000,
            Bucket::Treasury => 15_000_000,
            Bucket::Founder => 10_000_000,
            Bucket::Market => 10_000_000,
            Bucket::Liquidity => 5_000_000,
        }
    }

    pub fn vesting(self) -> Vesting {
        match self {
            Bucket::Community | Bucket::Market => Vesting::Emission,
            Bucket::Team => Vesting::CliffLinear {
                cliff_months: 12,
                linear_months: 36,
            },
            Bucket::Treasury => Vesting::CliffLinear {
                cliff_months: 0,
                linear_months: 48,
            },
            Bucket::Founder => Vesting::CliffLinear {
                cliff_months: 12,
                linear_months: 48,
            },
            Bucket::Liquidity => Vesting::Immediate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsidyParams {
    pub total_supply: u64,
    pub target_years: u64,
    pub target_block_time_secs: u64,
    pub min_subsidy: u64,
    pub max_subsidy: u64,
    /// Emitted once the cap is reached; zero disables tail emission.
    pub tail_emission: u64,
}

impl Default for SubsidyParams {
    fn default() -> Self {
        Self {
            total_supply: TOTAL_SUPPLY,
            target_years: DEFAULT_TARGET_YEARS,
            target_block_time_secs: DEFAULT_TARGET_BLOCK_TIME_SECS,
            min_subsidy: MIN_SUBSIDY,
            max_subsidy: MAX_SUBSIDY,
            tail_emission: 0,
        }
    }
}

/// Congestion pressure in parts-per-thousand, bounded at 3.000.
pub fn pressure_ppt(signals: &SignalSnapshot) -> u64 {
    let fee_pressure = signals.fee_fast.saturating_mul(20).min(3_000);
    let mempool_pressure = (signals.mempool_txs / 50).min(3_000);
    fee_pressure.max(mempool_pressure)
}

/// Unsmoothed consensus multiplier in [1.000, 1.750] parts-per-thousand.
pub fn multiplier_ppt(signals: &SignalSnapshot) -> u64 {
    1_000 + (pressure_ppt(signals) / 4).min(750)
}

/// Deterministic per-block subsidy. Monotonically non-increasing in
/// `minted_total`, non-decreasing in pressure.
pub fn subsidy(params: &SubsidyParams, height: u64, minted_total: u64, signals: &SignalSnapshot) -> u64 {
    let remaining = params.total_supply.saturating_sub(minted_total);
    if remaining == 0 {
        return params.tail_emission;
    }
    let target_blocks = params.target_years * SECONDS_PER_YEAR / params.target_block_time_secs;
    let remaining_blocks = target_blocks.saturating_sub(height).max(1);
    let baseline = (remaining / remaining_blocks).max(1);
    let boosted = (baseline as u128 * multiplier_ppt(signals) as u128 / 1_000) as u64;
    boosted
        .clamp(params.min_subsidy, params.max_subsidy)
        .min(remaining)
}

/// Persisted emission record, mirrored to `token_state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionState {
    pub emission_pool_total: u64,
    pub remaining_pool: u64,
    pub minted_total: u64,
    pub epoch_length_sec: u64,
    pub genesis_ts: u64,
    pub last_emission_ts: u64,
    pub last_reward: u64,
}

impl EmissionState {
    pub fn genesis(genesis_ts: u64) -> Self {
        Self {
            emission_pool_total: EMISSION_POOL_TOTAL,
            remaining_pool: EMISSION_POOL_TOTAL,
            minted_total: 0,
            epoch_length_sec: DEFAULT_EPOCH_LENGTH_SECS,
            genesis_ts,
            last_emission_ts: 0,
            last_reward: 0,
        }
    }

    pub fn epoch(&self, now_ts: u64) -> u64 {
        if self.epoch_length_sec == 0 {
            return 0;
        }
        now_ts.saturating_sub(self.genesis_ts) / self.epoch_length_sec
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenomicsError {
    #[error("tokenomics io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tokenomics state malformed: {0}")]
    Malformed(String),
}

pub struct TokenomicsEngine {
    path: PathBuf,
    params: SubsidyParams,
    state: EmissionState,
}

impl TokenomicsEngine {
    pub const STATE_FILE: &'static str = "token_state.json";

    /// Loads persisted emission state or initializes a genesis record.
    pub fn open(datadir: &Path, params: SubsidyParams, genesis_ts: u64) -> Result<Self, TokenomicsError> {
        let path = datadir.join(Self::STATE_FILE);
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| TokenomicsError::Malformed(e.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let state = EmissionState::genesis(genesis_ts);
                atomic_write(&path, &serde_json::to_vec_pretty(&state).unwrap_or_default())?;
                info!(path = %path.display(), "initialized emission state");
                state
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            params,
            state,
        })
    }

    pub fn params(&self) -> &SubsidyParams {
        &self.params
    }

    pub fn state(&self) -> &EmissionState {
        &self.state
    }

    pub fn subsidy_for(&self, height: u64, signals: &SignalSnapshot) -> u64 {
        subsidy(&self.params, height, self.state.minted_total, signals)
    }

    /// Advances emission after a block is durable. The new state is staged
    /// to disk first; in-memory state only moves once the write succeeded.
    pub fn apply(&mut self, block_minted: u64, now_ts: u64) -> Result<(), TokenomicsError> {
        let mut next = self.state.clone();
        next.minted_total = next.minted_total.saturating_add(block_minted);
        next.remaining_pool = next.remaining_pool.saturating_sub(block_minted);
        next.last_reward = block_minted;
        next.last_emission_ts = now_ts;
        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| TokenomicsError::Malformed(e.to_string()))?;
        atomic_write(&self.path, &bytes)?;
        self.state = next;
        Ok(())
    }

    /// Amount of a bucket available at `now_ts`. Community and Market report
    /// their emitted share of `minted_total` (45:10 of the pool).
    pub fn vested(&self, bucket: Bucket, now_ts: u64) -> u64 {
        let total = bucket.total();
        match bucket.vesting() {
            Vesting::Immediate => total,
            Vesting::Emission => {
                (self.state.minted_total as u128 * total as u128 / EMISSION_POOL_TOTAL as u128)
                    as u64
            }
            Vesting::CliffLinear {
                cliff_months,
                linear_months,
            } => {
                let start = self.state.genesis_ts;
                let cliff_end = start.saturating_add(cliff_months * MONTH_SECS);
                if now_ts < cliff_end {
                    return 0;
                }
                let span = linear_months * MONTH_SECS;
                let elapsed = now_ts - cliff_end;
                if span == 0 || elapsed >= span {
                    total
                } else {
                    (total as u128 * elapsed as u128 / span as u128) as u64
                }
            }
        }
    }
}
