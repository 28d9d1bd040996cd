//! Proof-of-work target handling, nonce search, and difficulty
//! retargeting.
//!
//! The compact `bits` form follows the Bitcoin encoding: one size byte and
//! a three-byte mantissa. Miners and verifiers both expand it through
//! [`compact_to_target`] so the acceptance predicate is identical on every
//! path.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use sentra_core::BlockHeader;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Easiest permitted target; also the genesis default.
pub const MAX_TARGET_BITS: u32 = 0x207f_ffff;

/// Cancellation flag check interval during nonce search.
pub const CANCEL_CHECK_STRIDE: u64 = 1 << 16;

/// Retarget ratio clamp: the adjusted spacing never moves more than 4x in
/// either direction per retarget.
pub const MAX_ADJUSTMENT_FACTOR: u64 = 4;

pub fn compact_to_target(bits: u32) -> Option<BigUint> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x00ff_ffff;
    if mantissa == 0 {
        return None;
    }
    let mut target = BigUint::from(mantissa);
    if exponent > 3 {
        target <<= 8 * (exponent - 3);
    } else {
        target >>= 8 * (3 - exponent);
    }
    if target.is_zero() {
        return None;
    }
    Some(target)
}

pub fn target_to_compact(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let bytes = target.to_bytes_be();
    let mut size = bytes.len() as u32;
    let mut compact: u32 = if bytes.len() <= 3 {
        let mut value: u32 = 0;
        for byte in &bytes {
            value = (value << 8) | u32::from(*byte);
        }
        value << (8 * (3 - bytes.len() as u32))
    } else {
        let mut value: u32 = 0;
        for byte in &bytes[..3] {
            value = (value << 8) | u32::from(*byte);
        }
        value
    };
    // Keep the mantissa sign bit clear, as the compact form reserves it.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// The consensus acceptance predicate: header hash, read big-endian, must
/// not exceed the expanded target.
pub fn hash_meets_target(hash: &[u8; 32], bits: u32) -> bool {
    match compact_to_target(bits) {
        Some(target) => BigUint::from_bytes_be(hash) <= target,
        None => false,
    }
}

/// Nonce search over the header. Increments the 64-bit nonce, bumping the
/// timestamp and restarting on exhaustion; checks the cancellation flag at
/// a bounded stride. Returns false iff cancelled.
pub fn solve(header: &mut BlockHeader, cancel: &AtomicBool) -> bool {
    if compact_to_target(header.bits).is_none() {
        return false;
    }
    let mut iterations: u64 = 0;
    loop {
        if hash_meets_target(&header.hash(), header.bits) {
            debug!(nonce = header.nonce, "pow solution found");
            return true;
        }
        iterations = iterations.wrapping_add(1);
        if iterations % CANCEL_CHECK_STRIDE == 0 && cancel.load(Ordering::Relaxed) {
            return false;
        }
        header.nonce = match header.nonce.checked_add(1) {
            Some(nonce) => nonce,
            None => {
                header.timestamp += 1;
                0
            }
        };
    }
}

/// Recompute `bits` from the median inter-block spacing over the retarget
/// window so spacing trends toward `target_spacing_secs`. The ratio is
/// clamped to [1/4, 4] and the result never exceeds the maximum target.
pub fn retarget(prev_bits: u32, spacings: &[u64], target_spacing_secs: u64) -> u32 {
    let prev_target = match compact_to_target(prev_bits) {
        Some(target) => target,
        None => return prev_bits,
    };
    if spacings.is_empty() || target_spacing_secs == 0 {
        return prev_bits;
    }
    let mut sorted = spacings.to_vec();
    sorted.sort_unstable();
    let median = if sorted.len() % 2 == 1 {
        sorted[sorted.len() / 2]
    } else {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2
    };
    let clamped = median
        .clamp(
            target_spacing_secs / MAX_ADJUSTMENT_FACTOR,
            target_spacing_secs * MAX_ADJUSTMENT_FACTOR,
        )
        .max(1);
    let mut next = prev_target * BigUint::from(clamped) / BigUint::from(target_spacing_secs);
    if next.is_zero() {
        next = BigUint::one();
    }
    let max_target = match compact_to_target(MAX_TARGET_BITS) {
        Some(target) => target,
        None => return prev_bits,
    };
    if next > max_target {
        next = max_target;
    }
    target_to_compact(&next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentra_core::{BlockHeader, BLOCK_VERSION, ZERO_HASH};

    fn header(bits: u32) -> BlockHeader {
        BlockHeader {
            version: BLOCK_VERSION,
            prev_hash: ZERO_HASH,
            merkle_root: [3u8; 32],
            timestamp: 1_700_000_000,
            bits,
            nonce: 0,
        }
    }

    #[test]
    fn compact_roundtrip_is_stable() {
        for bits in [MAX_TARGET_BITS, 0x1d00_ffff, 0x1f12_3456u32] {
            let target = compact_to_target(bits).unwrap();
            assert_eq!(target_to_compact(&target), bits);
        }
    }

    #[test]
    fn zero_mantissa_has_no_target() {
        assert!(compact_to_target(0x2000_0000).is_none());
        assert!(!hash_meets_target(&[0u8; 32], 0x2000_0000));
    }

    #[test]
    fn solved_header_passes_the_same_predicate() {
        let mut h = header(0x1f00_ffff);
        let cancel = AtomicBool::new(false);
        assert!(solve(&mut h, &cancel));
        assert!(hash_meets_target(&h.hash(), h.bits));
    }

    #[test]
    fn max_target_accepts_nearly_everything() {
        let mut h = header(MAX_TARGET_BITS);
        let cancel = AtomicBool::new(false);
        assert!(solve(&mut h, &cancel));
        assert!(h.nonce < 16, "max target should solve within a few nonces");
    }

    #[test]
    fn cancelled_search_stops() {
        // Mantissa of 1 at minimal exponent: effectively unsatisfiable.
        let mut h = header(0x0300_0001);
        let cancel = AtomicBool::new(true);
        assert!(!solve(&mut h, &cancel));
    }

    #[test]
    fn slow_blocks_ease_the_target() {
        let bits = 0x1d00_ffff;
        let eased = retarget(bits, &[120, 130, 110, 125, 115], 60);
        let prev = compact_to_target(bits).unwrap();
        let next = compact_to_target(eased).unwrap();
        assert!(next > prev);
    }

    #[test]
    fn fast_blocks_tighten_the_target() {
        let bits = 0x1d00_ffff;
        let tightened = retarget(bits, &[30, 20, 25, 35, 30], 60);
        let prev = compact_to_target(bits).unwrap();
        let next = compact_to_target(tightened).unwrap();
        assert!(next < prev);
    }

    #[test]
    fn adjustment_is_clamped_to_four_x() {
        let bits = 0x1d00_ffff;
        let prev = compact_to_target(bits).unwrap();
        let eased = compact_to_target(retarget(bits, &[100_000], 60)).unwrap();
        assert!(eased <= prev.clone() * BigUint::from(4u32));
        let tightened = compact_to_target(retarget(bits, &[0, 0, 0], 60)).unwrap();
        assert!(tightened >= prev / BigUint::from(4u32) - BigUint::from(1u32));
    }

    #[test]
    fn retarget_never_exceeds_max_target() {
        let eased = retarget(MAX_TARGET_BITS, &[100_000], 60);
        assert_eq!(eased, MAX_TARGET_BITS);
    }
}
