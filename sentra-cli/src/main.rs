use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use sentra_config::SentraConfig;
use sentra_core::{now_ts, Transaction, TxOutput};
use sentra_node::{init_logging, Node};
use sentra_wallet::WalletStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sentra", version, about = "Sentra node CLI")]
struct Cli {
    /// Node configuration file.
    #[arg(long, global = true, default_value = "config/sentra.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example configuration file
    Init,
    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        cmd: WalletCmd,
    },
    /// Sign a transfer with a stored wallet and submit it
    Submit {
        #[arg(long)]
        from: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        #[arg(long)]
        fee: u64,
        #[arg(long)]
        memo: Option<String>,
    },
    /// Mine one or more blocks to an address
    Mine {
        #[arg(long)]
        miner: String,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Show an account balance
    Balance { addr: String },
    /// Show the last N block summaries
    Tail {
        #[arg(default_value_t = 10)]
        n: usize,
    },
    /// Recompute the rewards ledger hash chain
    VerifyLedger,
    /// Show emission state, epoch, and vesting
    Emission,
}

#[derive(Subcommand)]
enum WalletCmd {
    New {
        #[arg(long, default_value = "default")]
        name: String,
        #[arg(long)]
        password: String,
    },
    List,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init => {
            if cli.config.exists() {
                println!("config already exists at {}", cli.config.display());
                return Ok(());
            }
            SentraConfig::write_example(&cli.config)?;
            println!("wrote config to {}", cli.config.display());
        }
        Commands::Wallet { cmd } => match cmd {
            WalletCmd::New { name, password } => {
                let store = WalletStore::new(wallet_dir()?)?;
                let wallet = store.create(&name, &password)?;
                println!("created wallet {} with address {}", wallet.name, wallet.address);
            }
            WalletCmd::List => {
                let store = WalletStore::new(wallet_dir()?)?;
                for wallet in store.list()? {
                    println!("{} -> {}", wallet.name, wallet.address);
                }
            }
        },
        Commands::Submit {
            from,
            password,
            to,
            amount,
            fee,
            memo,
        } => {
            let node = open_node(&cli.config)?;
            let store = WalletStore::new(wallet_dir()?)?;
            let wallet = store.load(&from)?;
            let mut tx = Transaction {
                sender: wallet.address.clone(),
                outputs: vec![TxOutput { to, amount }],
                fee,
                memo,
                timestamp: now_ts(),
                nonce: node.account_nonce(&wallet.address) + 1,
                signature: Vec::new(),
            };
            tx.signature = wallet.sign(&password, &tx)?;
            let receipt = node
                .submit_tx(tx)
                .map_err(|e| anyhow!("{e} (kind: {})", e.kind()))?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::Mine { miner, count } => {
            let node = open_node(&cli.config)?;
            for _ in 0..count {
                let summary = node
                    .mine(&miner)
                    .map_err(|e| anyhow!("{e} (kind: {})", e.kind()))?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Commands::Balance { addr } => {
            let node = open_node(&cli.config)?;
            println!("{}", node.balance(&addr));
        }
        Commands::Tail { n } => {
            let node = open_node(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&node.chain_tail(n))?);
        }
        Commands::VerifyLedger => {
            let node = open_node(&cli.config)?;
            let report = node
                .verify_ledger()
                .map_err(|e| anyhow!("{e} (kind: {})", e.kind()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Emission => {
            let node = open_node(&cli.config)?;
            let status = node.emission_status(now_ts());
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

fn open_node(config: &PathBuf) -> Result<Node> {
    let cfg = SentraConfig::load(config)?;
    Node::open(&cfg)
}

fn wallet_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sentra")
        .join("wallets");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
