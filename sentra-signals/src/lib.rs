use parking_lot::Mutex;
use sentra_core::codec::{put_str, put_varint};
use sentra_core::{blake3_hash, now_ts, Hash32};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_SIGNAL_TTL_SECS: u64 = 30;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// External congestion metrics captured once per block and immutable after
/// being bound to a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub mempool_txs: u64,
    pub mempool_bytes: u64,
    pub fee_fast: u64,
    pub fee_hour: u64,
    pub fee_econ: u64,
    pub source_tag: String,
    pub captured_at: u64,
}

impl SignalSnapshot {
    pub fn zero() -> Self {
        Self {
            mempool_txs: 0,
            mempool_bytes: 0,
            fee_fast: 0,
            fee_hour: 0,
            fee_econ: 0,
            source_tag: "none".into(),
            captured_at: 0,
        }
    }

    /// Stable field order, big-endian integers; this is what the ledger
    /// digest commits to.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.mempool_txs.to_be_bytes());
        buf.extend_from_slice(&self.mempool_bytes.to_be_bytes());
        buf.extend_from_slice(&self.fee_fast.to_be_bytes());
        buf.extend_from_slice(&self.fee_hour.to_be_bytes());
        buf.extend_from_slice(&self.fee_econ.to_be_bytes());
        put_str(&mut buf, &self.source_tag);
        buf.extend_from_slice(&self.captured_at.to_be_bytes());
        let mut out = Vec::with_capacity(buf.len() + 2);
        put_varint(&mut out, buf.len() as u64);
        out.extend_from_slice(&buf);
        out
    }

    pub fn digest(&self) -> Hash32 {
        blake3_hash(&self.canonical_bytes())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("signal fetch timed out")]
    Timeout,
    #[error("signal transport: {0}")]
    Transport(String),
    #[error("malformed signal payload: {0}")]
    Malformed(String),
}

/// Capability the issuance path depends on; timeout and retry policy belong
/// to the implementation.
pub trait SignalSource: Send + Sync {
    fn fetch(&self) -> Result<SignalSnapshot, SignalError>;
}

/// Fixed snapshot, for tests and deterministic replay.
pub struct StaticSource {
    snapshot: SignalSnapshot,
}

impl StaticSource {
    pub fn new(snapshot: SignalSnapshot) -> Self {
        Self { snapshot }
    }
}

impl SignalSource for StaticSource {
    fn fetch(&self) -> Result<SignalSnapshot, SignalError> {
        Ok(self.snapshot.clone())
    }
}

struct CacheSlot {
    at: Instant,
    snapshot: SignalSnapshot,
}

/// TTL cache over any source. `snapshot()` never fails: a fetch error falls
/// back to the last good snapshot, then to the zero-pressure snapshot.
pub struct CachedSource {
    inner: Box<dyn SignalSource>,
    ttl: Duration,
    slot: Mutex<Option<CacheSlot>>,
}

impl CachedSource {
    pub fn new(inner: Box<dyn SignalSource>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> SignalSnapshot {
        {
            let slot = self.slot.lock();
            if let Some(cached) = slot.as_ref() {
                if cached.at.elapsed() < self.ttl {
                    return cached.snapshot.clone();
                }
            }
        }
        match self.inner.fetch() {
            Ok(snapshot) => {
                debug!(source = %snapshot.source_tag, "signal snapshot refreshed");
                *self.slot.lock() = Some(CacheSlot {
                    at: Instant::now(),
                    snapshot: snapshot.clone(),
                });
                snapshot
            }
            Err(err) => {
                let slot = self.slot.lock();
                match slot.as_ref() {
                    Some(cached) => {
                        warn!(error = %err, "signal fetch failed, using cached snapshot");
                        cached.snapshot.clone()
                    }
                    None => {
                        warn!(error = %err, "signal fetch failed with empty cache, using zero snapshot");
                        SignalSnapshot::zero()
                    }
                }
            }
        }
    }
}

impl SignalSource for CachedSource {
    fn fetch(&self) -> Result<SignalSnapshot, SignalError> {
        Ok(self.snapshot())
    }
}

/// mempool.space-compatible collector: `/api/v1/fees/recommended` and
/// `/api/mempool` under a configurable base URL.
pub struct HttpSource {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SignalError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn get_json(&self, path: &str) -> Result<serde_json::Value, SignalError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().map_err(|e| {
            if e.is_timeout() {
                SignalError::Timeout
            } else {
                SignalError::Transport(e.to_string())
            }
        })?;
        resp.json()
            .map_err(|e| SignalError::Malformed(e.to_string()))
    }
}

fn field_u64(value: &serde_json::Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

impl SignalSource for HttpSource {
    fn fetch(&self) -> Result<SignalSnapshot, SignalError> {
        let fees = self.get_json("/api/v1/fees/recommended")?;
        let mempool = self.get_json("/api/mempool")?;
        Ok(SignalSnapshot {
            mempool_txs: field_u64(&mempool, "count"),
            mempool_bytes: field_u64(&mempool, "vsize"),
            fee_fast: field_u64(&fees, "fastestFee"),
            fee_hour: field_u64(&fees, "hourFee"),
            fee_econ: field_u64(&fees, "economyFee"),
            source_tag: self.base_url.clone(),
            captured_at: now_ts(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    struct FlakySource {
        fail: Arc<AtomicBool>,
        fetches: Arc<AtomicU64>,
    }

    impl SignalSource for FlakySource {
        fn fetch(&self) -> Result<SignalSnapshot, SignalError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SignalError::Timeout);
            }
            Ok(SignalSnapshot {
                mempool_txs: 10,
                mempool_bytes: 1000,
                fee_fast: 50,
                fee_hour: 25,
                fee_econ: 10,
                source_tag: "flaky".into(),
                captured_at: 1,
            })
        }
    }

    fn flaky() -> (FlakySource, Arc<AtomicBool>, Arc<AtomicU64>) {
        let fail = Arc::new(AtomicBool::new(false));
        let fetches = Arc::new(AtomicU64::new(0));
        let source = FlakySource {
            fail: fail.clone(),
            fetches: fetches.clone(),
        };
        (source, fail, fetches)
    }

    #[test]
    fn digest_is_deterministic() {
        let a = SignalSnapshot::zero();
        let b = SignalSnapshot::zero();
        assert_eq!(a.digest(), b.digest());
        let mut c = SignalSnapshot::zero();
        c.fee_fast = 1;
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn zero_snapshot_is_all_zero() {
        let snap = SignalSnapshot::zero();
        assert_eq!(snap.mempool_txs, 0);
        assert_eq!(snap.fee_fast, 0);
        assert_eq!(snap.source_tag, "none");
        assert_eq!(snap.captured_at, 0);
    }

    #[test]
    fn cache_serves_within_ttl() {
        let (source, _fail, fetches) = flaky();
        let cached = CachedSource::new(Box::new(source), Duration::from_secs(60));
        let a = cached.snapshot();
        let b = cached.snapshot();
        assert_eq!(a, b);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fetch_failure_falls_back_to_cached() {
        let (source, fail, _fetches) = flaky();
        let cached = CachedSource::new(Box::new(source), Duration::from_secs(0));
        let first = cached.snapshot();
        assert_eq!(first.source_tag, "flaky");
        fail.store(true, Ordering::SeqCst);
        let second = cached.snapshot();
        assert_eq!(second, first);
    }

    #[test]
    fn fetch_failure_with_empty_cache_is_zero_pressure() {
        let (source, fail, _fetches) = flaky();
        fail.store(true, Ordering::SeqCst);
        let cached = CachedSource::new(Box::new(source), Duration::from_secs(60));
        assert_eq!(cached.snapshot(), SignalSnapshot::zero());
    }
}
