//! End-to-end scenarios driven through the node command surface.

use sentra_chain::{ChainHandle, ChainParams};
use sentra_config::{NodeSection, SentraConfig, SignalsSection};
use sentra_core::{Transaction, TxOutput};
use sentra_crypto::AcceptAllVerifier;
use sentra_node::Node;
use sentra_signals::{CachedSource, SignalSnapshot, StaticSource};
use sentra_tokenomics::EmissionState;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> SentraConfig {
    let mut cfg = SentraConfig::example();
    cfg.node = NodeSection {
        datadir: dir.path().to_path_buf(),
    };
    cfg.chain.signature_checks = false;
    cfg.signals = SignalsSection {
        endpoint: None,
        ttl_secs: 30,
        fetch_timeout_secs: 10,
    };
    cfg
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
        timestamp: sentra_core::now_ts(),
        nonce,
        signature: Vec::new(),
    }
}

#[test]
fn genesis_plus_one_empty_block() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(&test_config(&dir)).unwrap();
    assert_eq!(node.chain().tip().height, 0);

    let summary = node.mine("miner_a").unwrap();
    assert_eq!(summary.height, 1);
    assert_eq!(summary.coinbase_out, 19);
    assert_eq!(node.balance("miner_a"), 19);

    let status = node.emission_status(summary.timestamp);
    assert_eq!(status.state.minted_total, 19);
    assert_eq!(status.state.last_reward, 19);

    let entries = node.ledger_tail(10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].seq, 0);
    assert_eq!(entries[0].subsidy, 19);
    assert_eq!(entries[0].miner, "miner_a");
    assert_eq!(entries[0].prev_hash, "0".repeat(64));
}

#[test]
fn supply_cap_clamps_then_stops_emission() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    // Zero-horizon schedule: the whole remainder is due immediately, so the
    // cap, not the baseline, bounds the reward.
    cfg.chain.target_years = 0;

    let state = EmissionState {
        emission_pool_total: 55_000_000,
        remaining_pool: 0,
        minted_total: 99_999_990,
        epoch_length_sec: 86_400,
        genesis_ts: cfg.chain.genesis_ts,
        last_emission_ts: 0,
        last_reward: 0,
    };
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(
        dir.path().join("token_state.json"),
        serde_json::to_vec_pretty(&state).unwrap(),
    )
    .unwrap();

    let node = Node::open(&cfg).unwrap();
    let summary = node.mine("miner_a").unwrap();
    assert_eq!(summary.coinbase_out, 10);
    assert_eq!(node.emission_status(summary.timestamp).state.minted_total, 100_000_000);

    let summary = node.mine("miner_a").unwrap();
    assert_eq!(summary.coinbase_out, 0);
    let entries = node.ledger_tail(1).unwrap();
    assert_eq!(entries[0].subsidy, 0);
}

#[test]
fn fee_pressure_bumps_the_coinbase() {
    let dir = TempDir::new().unwrap();
    let mut snap = SignalSnapshot::zero();
    snap.fee_fast = 100;
    snap.captured_at = 7;
    let chain = ChainHandle::open(
        dir.path(),
        ChainParams::default(),
        Arc::new(AcceptAllVerifier),
        CachedSource::new(Box::new(StaticSource::new(snap.clone())), Duration::from_secs(30)),
    )
    .unwrap();

    let template = chain.build_block_template("miner_a").unwrap();
    // fee_pressure 2.0 -> multiplier 1.5 -> floor(19 * 1.5)
    assert_eq!(template.subsidy, 28);
    assert_eq!(template.snapshot, snap);

    let cancel = AtomicBool::new(false);
    let block = chain.mine(&template, &cancel).unwrap();
    let appended = chain.append_block(&block, &template).unwrap();
    assert_eq!(appended.coinbase_out, 28);

    let entries = chain.ledger_tail(1).unwrap();
    assert_eq!(entries[0].subsidy, 28);
    assert_eq!(
        entries[0].signals_digest,
        sentra_core::hex32(&snap.digest())
    );
}

#[test]
fn extreme_spam_is_denied_at_admission() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(&test_config(&dir)).unwrap();
    for _ in 0..8 {
        node.mine("alice").unwrap();
    }
    let mut tx = transfer("alice", "bob", 10, 0, 1);
    tx.outputs = (0..10)
        .map(|i| TxOutput {
            to: format!("out{i}"),
            amount: 1,
        })
        .collect();
    tx.memo = Some("FREE MONEY airdrop claim http://x".into());

    let err = node.submit_tx(tx).unwrap_err();
    assert_eq!(err.kind(), "policy_denied");
    match err {
        sentra_core::ChainError::PolicyDenied { reasons, suggestions } => {
            assert!(reasons.iter().any(|r| r == "tx_denied_extreme_spam"));
            assert!(!suggestions.is_empty());
        }
        other => panic!("expected PolicyDenied, got {other:?}"),
    }
    // Nothing entered the pool; the next block is empty apart from coinbase.
    let summary = node.mine("miner_b").unwrap();
    assert_eq!(summary.tx_count, 1);
}

#[test]
fn tampered_ledger_is_reported_with_stale_successor() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(&test_config(&dir)).unwrap();
    for _ in 0..3 {
        node.mine("miner_a").unwrap();
    }

    let path = dir.path().join("rewards_ledger.jsonl");
    let content = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
    assert_eq!(lines.len(), 3);
    lines[1] = lines[1].replace("miner_a", "miner_x");
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    let report = node.verify_ledger().unwrap();
    assert!(!report.ok);
    let first = report.first_divergence.expect("first divergence");
    assert_eq!(first.seq, 1);
    assert!(report
        .divergences
        .iter()
        .any(|d| d.seq == 2 && d.reason.contains("stale")));

    // Mining stays halted until the ledger verifies clean again.
    assert!(node.mine("miner_a").is_err());
    std::fs::write(&path, content).unwrap();
    assert!(node.verify_ledger().unwrap().ok);
    node.mine("miner_a").unwrap();
}

#[test]
fn higher_fee_tx_is_ordered_first() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(&test_config(&dir)).unwrap();
    for _ in 0..8 {
        node.mine("sender_a").unwrap();
    }
    for _ in 0..8 {
        node.mine("sender_b").unwrap();
    }
    node.submit_tx(transfer("sender_a", "sink", 100, 10, 1)).unwrap();
    node.submit_tx(transfer("sender_b", "sink", 100, 50, 1)).unwrap();

    let template = node.chain().build_block_template("miner_c").unwrap();
    let body = &template.block.transactions;
    assert_eq!(body.len(), 3);
    assert!(body[0].is_coinbase());
    assert_eq!(body[1].sender, "sender_b");
    assert_eq!(body[2].sender, "sender_a");

    let summary = node.mine("miner_c").unwrap();
    assert_eq!(summary.tx_count, 3);
    assert_eq!(node.balance("sink"), 200);
}

#[test]
fn conservation_holds_across_a_workload() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(&test_config(&dir)).unwrap();
    for _ in 0..10 {
        node.mine("alice").unwrap();
    }
    node.submit_tx(transfer("alice", "bob", 30, 110, 1)).unwrap();
    node.mine("bob").unwrap();
    node.submit_tx(transfer("bob", "carol", 10, 120, 1)).unwrap();
    node.mine("carol").unwrap();

    let minted = node.emission_status(sentra_core::now_ts()).state.minted_total;
    assert!(minted <= 100_000_000);

    // The state mirror must agree: total balances equal total minted.
    let state: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("state.json")).unwrap()).unwrap();
    let total: u64 = state["balances"]
        .as_object()
        .unwrap()
        .values()
        .map(|v| v.as_u64().unwrap())
        .sum();
    assert_eq!(total, minted);
    assert_eq!(state["tip_height"].as_u64().unwrap(), 12);
}
