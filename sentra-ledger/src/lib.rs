//! Append-only, hash-chained rewards ledger.
//!
//! One JSON object per line; every entry commits to its predecessor through
//! `entry_hash = SHA-256(prev_hash || canonical_fields)`. The file is an
//! audit trail, not the source of truth: it is written only after the block
//! and emission state are durable, and it can be verified offline.

use sentra_core::codec::{put_str, put_varint};
use sentra_core::{from_hex32, hex32, sha256, Hash32, ZERO_HASH};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub block_height: u64,
    pub miner: String,
    pub subsidy: u64,
    pub fees_total: u64,
    pub signals_digest: String,
    pub policy_decisions_digest: String,
    pub timestamp: u64,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Everything the caller knows before the chain hashes are assigned.
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub block_height: u64,
    pub miner: String,
    pub subsidy: u64,
    pub fees_total: u64,
    pub signals_digest: Hash32,
    pub policy_decisions_digest: Hash32,
    pub timestamp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger corrupt at seq {seq} (byte offset {offset}): {detail}")]
    Corrupt {
        seq: u64,
        offset: u64,
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Divergence {
    pub seq: u64,
    pub offset: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub entries: u64,
    pub head_hash: String,
    pub ok: bool,
    pub first_divergence: Option<Divergence>,
    pub divergences: Vec<Divergence>,
    /// Byte offset of an unparseable trailing fragment; a warning, not a
    /// chain failure.
    pub trailing_corruption: Option<u64>,
}

/// Canonical byte form hashed into `entry_hash`: stable field order,
/// big-endian integers, length-prefixed UTF-8, raw digest bytes. No floats.
fn canonical_fields(seq: u64, draft: &EntryDraft) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96 + draft.miner.len());
    put_varint(&mut buf, seq);
    put_varint(&mut buf, draft.block_height);
    put_str(&mut buf, &draft.miner);
    buf.extend_from_slice(&draft.subsidy.to_be_bytes());
    buf.extend_from_slice(&draft.fees_total.to_be_bytes());
    buf.extend_from_slice(&draft.signals_digest);
    buf.extend_from_slice(&draft.policy_decisions_digest);
    buf.extend_from_slice(&draft.timestamp.to_be_bytes());
    buf
}

fn compute_entry_hash(prev_hash: &Hash32, fields: &[u8]) -> Hash32 {
    let mut data = Vec::with_capacity(32 + fields.len());
    data.extend_from_slice(prev_hash);
    data.extend_from_slice(fields);
    sha256(&data)
}

fn draft_of(entry: &LedgerEntry) -> Result<EntryDraft, String> {
    Ok(EntryDraft {
        block_height: entry.block_height,
        miner: entry.miner.clone(),
        subsidy: entry.subsidy,
        fees_total: entry.fees_total,
        signals_digest: from_hex32(&entry.signals_digest).map_err(|e| e.to_string())?,
        policy_decisions_digest: from_hex32(&entry.policy_decisions_digest)
            .map_err(|e| e.to_string())?,
        timestamp: entry.timestamp,
    })
}

pub struct RewardsLedger {
    path: PathBuf,
    next_seq: u64,
    head_hash: Hash32,
    /// Byte length of the valid prefix; everything past it is an
    /// unparseable trailing fragment awaiting truncation.
    clean_len: u64,
    trailing_corruption: bool,
}

struct ScannedFile {
    entries: Vec<(u64, LedgerEntry)>, // (line start offset, entry)
    clean_len: u64,
    trailing_corruption: Option<u64>,
}

fn scan_file(path: &Path) -> Result<ScannedFile, LedgerError> {
    let mut content = String::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_string(&mut content)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    let mut entries = Vec::new();
    let mut offset = 0u64;
    let mut clean_len = 0u64;
    let mut trailing_corruption = None;
    let mut rest = content.as_str();
    let mut seq_expected = 0u64;
    while !rest.is_empty() {
        let (line, complete, consumed) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], true, idx + 1),
            None => (rest, false, rest.len()),
        };
        if !complete {
            // A crash mid-append leaves a fragment without its newline.
            trailing_corruption = Some(offset);
            break;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => {
                if entry.seq != seq_expected {
                    return Err(LedgerError::Corrupt {
                        seq: entry.seq,
                        offset,
                        detail: format!("expected seq {seq_expected}"),
                    });
                }
                entries.push((offset, entry));
                seq_expected += 1;
                offset += consumed as u64;
                clean_len = offset;
            }
            Err(err) => {
                if rest[consumed..].is_empty() {
                    trailing_corruption = Some(offset);
                    break;
                }
                return Err(LedgerError::Corrupt {
                    seq: seq_expected,
                    offset,
                    detail: format!("unparseable line: {err}"),
                });
            }
        }
        rest = &content[clean_len as usize..];
    }
    Ok(ScannedFile {
        entries,
        clean_len,
        trailing_corruption,
    })
}

impl RewardsLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let scanned = scan_file(path)?;
        let (next_seq, head_hash) = match scanned.entries.last() {
            Some((offset, entry)) => {
                let head = from_hex32(&entry.entry_hash).map_err(|e| LedgerError::Corrupt {
                    seq: entry.seq,
                    offset: *offset,
                    detail: e.to_string(),
                })?;
                (entry.seq + 1, head)
            }
            None => (0, ZERO_HASH),
        };
        if scanned.trailing_corruption.is_some() {
            warn!(path = %path.display(), "rewards ledger has a trailing partial line; it will be truncated on next append");
        }
        Ok(Self {
            path: path.to_path_buf(),
            next_seq,
            head_hash,
            clean_len: scanned.clean_len,
            trailing_corruption: scanned.trailing_corruption.is_some(),
        })
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn head_hash(&self) -> Hash32 {
        self.head_hash
    }

    /// Durable append: serialize, write the line, flush, fsync. Either the
    /// entry is fully on disk or (after the next truncation pass) absent.
    pub fn append(&mut self, draft: EntryDraft) -> Result<LedgerEntry, LedgerError> {
        if self.trailing_corruption {
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(self.clean_len)?;
            file.sync_all()?;
            self.trailing_corruption = false;
            info!(path = %self.path.display(), len = self.clean_len, "truncated trailing ledger fragment");
        }
        let seq = self.next_seq;
        let fields = canonical_fields(seq, &draft);
        let entry_hash = compute_entry_hash(&self.head_hash, &fields);
        let entry = LedgerEntry {
            seq,
            block_height: draft.block_height,
            miner: draft.miner,
            subsidy: draft.subsidy,
            fees_total: draft.fees_total,
            signals_digest: hex32(&draft.signals_digest),
            policy_decisions_digest: hex32(&draft.policy_decisions_digest),
            timestamp: draft.timestamp,
            prev_hash: hex32(&self.head_hash),
            entry_hash: hex32(&entry_hash),
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| LedgerError::Corrupt {
            seq,
            offset: self.clean_len,
            detail: e.to_string(),
        })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_data()?;
        self.clean_len += line.len() as u64;
        self.next_seq = seq + 1;
        self.head_hash = entry_hash;
        Ok(entry)
    }

    /// Full offline audit: re-read the file, recompute every hash, check
    /// every link. Reports the first divergence and all subsequent ones.
    pub fn verify(&self) -> Result<VerifyReport, LedgerError> {
        let scanned = scan_file(&self.path)?;
        let mut divergences = Vec::new();
        let mut running_hash = ZERO_HASH;
        for (offset, entry) in &scanned.entries {
            match draft_of(entry) {
                Ok(draft) => {
                    let stored_prev = from_hex32(&entry.prev_hash).unwrap_or(ZERO_HASH);
                    if stored_prev != running_hash {
                        divergences.push(Divergence {
                            seq: entry.seq,
                            offset: *offset,
                            reason: "prev_hash is stale: does not match predecessor entry_hash"
                                .into(),
                        });
                    }
                    let fields = canonical_fields(entry.seq, &draft);
                    let recomputed = compute_entry_hash(&stored_prev, &fields);
                    if hex32(&recomputed) != entry.entry_hash {
                        divergences.push(Divergence {
                            seq: entry.seq,
                            offset: *offset,
                            reason: "entry_hash mismatch: fields were altered".into(),
                        });
                    }
                    // Chain onward from what the fields actually hash to,
                    // so a single tampered entry flags every successor.
                    running_hash = recomputed;
                }
                Err(detail) => {
                    divergences.push(Divergence {
                        seq: entry.seq,
                        offset: *offset,
                        reason: format!("undecodable digest field: {detail}"),
                    });
                    running_hash = from_hex32(&entry.entry_hash).unwrap_or(ZERO_HASH);
                }
            }
        }
        let head_hash = scanned
            .entries
            .last()
            .map(|(_, e)| e.entry_hash.clone())
            .unwrap_or_else(|| hex32(&ZERO_HASH));
        Ok(VerifyReport {
            entries: scanned.entries.len() as u64,
            head_hash,
            ok: divergences.is_empty(),
            first_divergence: divergences.first().cloned(),
            divergences,
            trailing_corruption: scanned.trailing_corruption,
        })
    }

    pub fn tail(&self, n: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let scanned = scan_file(&self.path)?;
        let entries: Vec<LedgerEntry> = scanned.entries.into_iter().map(|(_, e)| e).collect();
        let start = entries.len().saturating_sub(n);
        Ok(entries[start..].to_vec())
    }
}
