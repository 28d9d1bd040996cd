use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub datadir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSection {
    pub total_supply: u64,
    pub target_years: u64,
    pub target_block_time_secs: u64,
    pub min_subsidy: u64,
    pub max_subsidy: u64,
    pub tail_emission: u64,
    pub genesis_ts: u64,
    /// Compact difficulty bits for genesis and the first retarget window.
    pub initial_bits: u32,
    pub retarget_interval: u64,
    pub max_block_weight: u64,
    pub mempool_max_entries: usize,
    /// Disable only in throwaway development networks.
    pub signature_checks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsSection {
    /// mempool.space-compatible base URL; empty means no external source
    /// and zero-pressure issuance.
    pub endpoint: Option<String>,
    pub ttl_secs: u64,
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentraConfig {
    pub node: NodeSection,
    pub chain: ChainSection,
    pub signals: SignalsSection,
}

impl SentraConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SENTRA").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn example() -> Self {
        Self {
            node: NodeSection {
                datadir: PathBuf::from("data"),
            },
            chain: ChainSection {
                total_supply: 100_000_000,
                target_years: 10,
                target_block_time_secs: 60,
                min_subsidy: 1,
                max_subsidy: 5_000,
                tail_emission: 0,
                genesis_ts: 1_700_000_000,
                initial_bits: 0x207f_ffff,
                retarget_interval: 10,
                max_block_weight: 100_000,
                mempool_max_entries: 10_000,
                signature_checks: true,
            },
            signals: SignalsSection {
                endpoint: Some("https://mempool.space".into()),
                ttl_secs: 30,
                fetch_timeout_secs: 10,
            },
        }
    }

    pub fn write_example(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(&Self::example())?)?;
        Ok(())
    }
}
