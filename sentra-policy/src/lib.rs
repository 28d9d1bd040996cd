//! Guardian: deterministic transaction risk scoring.
//!
//! Every feature contribution is an integer number of centi-points, so the
//! same transaction and burst context always produce the same decision.
//! There is no wall-clock read anywhere in the scorer; the burst context is
//! derived from transaction timestamps supplied by the caller.

use once_cell::sync::Lazy;
use sentra_core::codec::put_varint;
use sentra_core::{blake3_hash, Address, Hash32, Transaction};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Memo phrases that mark promotional or scam-shaped payloads.
static MEMO_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "http://",
        "https://",
        "www.",
        "free money",
        "airdrop",
        "claim",
        "giveaway",
        "seed phrase",
        "double your",
        "guaranteed returns",
    ]
});

pub const BURST_WINDOW_SECS: u64 = 60;

const PATTERN_HIT_CENTI: u32 = 15;
const PATTERN_CAP_CENTI: u32 = 45;
const MANY_OUTPUTS_CENTI: u32 = 15;
const ZERO_FEE_CENTI: u32 = 35;
const LOW_FEE_CENTI: u32 = 15;
const FEE_RATIO_CENTI: u32 = 10;
const LONG_MEMO_CENTI: u32 = 5;
const BURST_HIT_CENTI: u32 = 5;
const BURST_CAP_CENTI: u32 = 25;

const MANY_OUTPUTS_THRESHOLD: usize = 6;
const LOW_FEE_THRESHOLD: u64 = 100;
const LONG_MEMO_BYTES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Allow,
    Warn,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    /// Suspicion in centi-points, 0..=100.
    pub suspicion_centi: u32,
    /// Effective-fee multiplier in parts-per-thousand; zero when denied.
    pub fee_multiplier_ppt: u64,
    pub reasons: Vec<String>,
    pub suggestions: Vec<String>,
}

impl PolicyDecision {
    pub fn allowed(&self) -> bool {
        self.verdict != Verdict::Deny
    }

    pub fn envelope(&self) -> DecisionEnvelope {
        DecisionEnvelope {
            ok: self.allowed(),
            suspicion: self.suspicion_centi as f64 / 100.0,
            fee_multiplier: self.fee_multiplier_ppt as f64 / 1_000.0,
            reasons: self.reasons.clone(),
            suggestions: self.suggestions.clone(),
        }
    }
}

/// Caller-facing decision shape; the two ratios have at most four decimals
/// by construction (centi-points and parts-per-thousand).
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEnvelope {
    pub ok: bool,
    pub suspicion: f64,
    pub fee_multiplier: f64,
    pub reasons: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Burst context the chain derives from admission history. Pure data so the
/// scorer stays referentially transparent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreContext {
    /// Submissions from the same sender inside the trailing 60 s window,
    /// not counting the transaction being scored.
    pub recent_sends: u32,
}

#[derive(Debug, Default)]
pub struct Guardian;

impl Guardian {
    pub fn new() -> Self {
        Self
    }

    pub fn score_tx(&self, tx: &Transaction, ctx: &ScoreContext) -> PolicyDecision {
        let mut suspicion = 0u32;
        let mut reasons = Vec::new();
        let mut suggestions = Vec::new();

        if let Some(memo) = &tx.memo {
            let lowered = memo.to_lowercase();
            let hits = MEMO_PATTERNS
                .iter()
                .filter(|p| lowered.contains(*p))
                .count() as u32;
            if hits > 0 {
                suspicion += (hits * PATTERN_HIT_CENTI).min(PATTERN_CAP_CENTI);
                reasons.push("memo_matches_spam_patterns".into());
                suggestions.push("remove urls and promotional phrases from the memo".into());
            }
            if memo.len() > LONG_MEMO_BYTES {
                suspicion += LONG_MEMO_CENTI;
                reasons.push("long_memo".into());
                suggestions.push("shorten the memo".into());
            }
        }

        if tx.outputs.len() >= MANY_OUTPUTS_THRESHOLD {
            suspicion += MANY_OUTPUTS_CENTI;
            reasons.push("many_outputs".into());
            suggestions.push("split the payment into fewer outputs".into());
        }

        if tx.fee == 0 {
            suspicion += ZERO_FEE_CENTI;
            reasons.push("zero_fee".into());
            suggestions.push(format!("increase fee above {LOW_FEE_THRESHOLD}"));
        } else if tx.fee < LOW_FEE_THRESHOLD {
            suspicion += LOW_FEE_CENTI;
            reasons.push("low_fee".into());
            suggestions.push(format!("increase fee above {LOW_FEE_THRESHOLD}"));
        }

        let total_amount = tx.total_output().unwrap_or(u64::MAX);
        if total_amount > 0
            && tx.fee > 0
            && (tx.fee as u128 * 100_000) < total_amount as u128
        {
            suspicion += FEE_RATIO_CENTI;
            reasons.push("negligible_fee_ratio".into());
            suggestions.push("raise the fee relative to the amount moved".into());
        }

        if ctx.recent_sends > 0 {
            suspicion += (ctx.recent_sends * BURST_HIT_CENTI).min(BURST_CAP_CENTI);
            reasons.push("sender_burst".into());
            suggestions.push("space out submissions from this sender".into());
        }

        let suspicion_centi = suspicion.min(100);
        let (verdict, fee_multiplier_ppt, mandatory) = match suspicion_centi {
            0..=39 => (Verdict::Allow, 1_000, None),
            40..=69 => (Verdict::Warn, 2_000, Some("suspicious_tx_warning")),
            70..=89 => (Verdict::Warn, 5_000, Some("high_risk_tx_warning")),
            _ => (Verdict::Deny, 0, Some("tx_denied_extreme_spam")),
        };
        if let Some(tag) = mandatory {
            reasons.insert(0, tag.to_string());
        }

        PolicyDecision {
            verdict,
            suspicion_centi,
            fee_multiplier_ppt,
            reasons,
            suggestions,
        }
    }
}

/// Moving per-sender submission counter over the trailing window, driven by
/// transaction timestamps rather than the wall clock.
#[derive(Debug, Default, Clone)]
pub struct BurstTracker {
    recent: HashMap<Address, VecDeque<u64>>,
}

impl BurstTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context_for(&mut self, sender: &str, ts: u64) -> ScoreContext {
        let cutoff = ts.saturating_sub(BURST_WINDOW_SECS);
        let recent_sends = match self.recent.get_mut(sender) {
            Some(times) => {
                while times.front().is_some_and(|t| *t < cutoff) {
                    times.pop_front();
                }
                times.iter().filter(|t| **t <= ts).count() as u32
            }
            None => 0,
        };
        ScoreContext { recent_sends }
    }

    pub fn observe(&mut self, sender: &str, ts: u64) {
        self.recent
            .entry(sender.to_string())
            .or_default()
            .push_back(ts);
    }
}

/// Commitment over a block's admission decisions, bound into the rewards
/// ledger next to the signal digest.
pub fn decisions_digest(decisions: &[(Hash32, &PolicyDecision)]) -> Hash32 {
    let mut buf = Vec::with_capacity(8 + decisions.len() * 48);
    put_varint(&mut buf, decisions.len() as u64);
    for (txid, decision) in decisions {
        buf.extend_from_slice(txid);
        buf.push(match decision.verdict {
            Verdict::Allow => 0,
            Verdict::Warn => 1,
            Verdict::Deny => 2,
        });
        buf.extend_from_slice(&decision.fee_multiplier_ppt.to_be_bytes());
        put_varint(&mut buf, decision.suspicion_centi as u64);
    }
    blake3_hash(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_core::TxOutput;

    fn tx(fee: u64, memo: Option<&str>, outputs: usize) -> Transaction {
        Transaction {
            sender: "alice".into(),
            outputs: (0..outputs)
                .map(|i| TxOutput {
                    to: format!("out{i}"),
                    amount: 100,
                })
                .collect(),
            fee,
            memo: memo.map(|m| m.to_string()),
            timestamp: 1_700_000_000,
            nonce: 1,
            signature: Vec::new(),
        }
    }

    #[test]
    fn clean_tx_is_allowed() {
        let decision = Guardian::new().score_tx(&tx(150, None, 1), &ScoreContext::default());
        assert_eq!(decision.verdict, Verdict::Allow);
        assert_eq!(decision.fee_multiplier_ppt, 1_000);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn spam_memo_zero_fee_many_outputs_is_denied() {
        let decision = Guardian::new().score_tx(
            &tx(0, Some("FREE MONEY airdrop claim http://x"), 10),
            &ScoreContext::default(),
        );
        assert_eq!(decision.verdict, Verdict::Deny);
        assert!(decision.suspicion_centi >= 90);
        assert!(decision
            .reasons
            .iter()
            .any(|r| r == "tx_denied_extreme_spam"));
    }

    #[test]
    fn warn_band_doubles_fee() {
        // zero fee (35) + negligible... zero fee alone is 35 -> allow;
        // add one memo pattern hit (15) -> 50 -> warn x2.
        let decision = Guardian::new().score_tx(
            &tx(0, Some("visit www.example"), 1),
            &ScoreContext::default(),
        );
        assert_eq!(decision.verdict, Verdict::Warn);
        assert_eq!(decision.fee_multiplier_ppt, 2_000);
        assert!(decision.reasons.iter().any(|r| r == "suspicious_tx_warning"));
    }

    #[test]
    fn high_band_quintuples_fee() {
        // patterns capped at 45 + zero fee 35 = 80 -> warn x5.
        let decision = Guardian::new().score_tx(
            &tx(0, Some("free money giveaway http://a www.b"), 1),
            &ScoreContext::default(),
        );
        assert_eq!(decision.suspicion_centi, 80);
        assert_eq!(decision.fee_multiplier_ppt, 5_000);
        assert!(decision.reasons.iter().any(|r| r == "high_risk_tx_warning"));
    }

    #[test]
    fn low_fee_and_ratio_features() {
        let mut t = tx(50, None, 1);
        t.outputs[0].amount = 100_000_000;
        let decision = Guardian::new().score_tx(&t, &ScoreContext::default());
        // low fee 15 + ratio 10 = 25 -> allow.
        assert_eq!(decision.suspicion_centi, 25);
        assert_eq!(decision.verdict, Verdict::Allow);
        assert!(decision.reasons.iter().any(|r| r == "low_fee"));
        assert!(decision.reasons.iter().any(|r| r == "negligible_fee_ratio"));
    }

    #[test]
    fn scoring_is_deterministic() {
        let guardian = Guardian::new();
        let t = tx(0, Some("claim your airdrop"), 7);
        let ctx = ScoreContext { recent_sends: 3 };
        assert_eq!(guardian.score_tx(&t, &ctx), guardian.score_tx(&t, &ctx));
    }

    #[test]
    fn burst_tracker_counts_trailing_window() {
        let mut tracker = BurstTracker::new();
        let base = 1_700_000_000;
        for i in 0..4 {
            tracker.observe("alice", base + i);
        }
        assert_eq!(tracker.context_for("alice", base + 10).recent_sends, 4);
        // Everything slides out of the 60 s window.
        assert_eq!(tracker.context_for("alice", base + 120).recent_sends, 0);
        assert_eq!(tracker.context_for("bob", base).recent_sends, 0);
    }

    #[test]
    fn envelope_floats_are_short() {
        let decision = Guardian::new().score_tx(
            &tx(0, Some("visit www.example"), 1),
            &ScoreContext::default(),
        );
        let json = serde_json::to_string(&decision.envelope()).unwrap();
        assert!(json.contains("\"suspicion\":0.5"));
        assert!(json.contains("\"fee_multiplier\":2.0"));
    }

    #[test]
    fn decisions_digest_changes_with_verdict() {
        let guardian = Guardian::new();
        let clean = guardian.score_tx(&tx(150, None, 1), &ScoreContext::default());
        let warn = guardian.score_tx(&tx(0, Some("www.x"), 1), &ScoreContext::default());
        let id = [7u8; 32];
        assert_ne!(
            decisions_digest(&[(id, &clean)]),
            decisions_digest(&[(id, &warn)])
        );
        assert_eq!(
            decisions_digest(&[(id, &clean)]),
            decisions_digest(&[(id, &clean)])
        );
    }
}
