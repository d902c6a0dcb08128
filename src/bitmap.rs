//! In-RAM armored allocation bitmap (§3 data model, §4.9 step 10-11).
//!
//! Persistence and the raw bit-test/set/clear primitive are external
//! collaborators (`hal::BitmapOp`); this module owns the in-RAM mirror:
//! one occupancy bit per block plus an ECC word per data word, held as an
//! "armored" pair so a single flipped bit in RAM is self-correcting rather
//! than silently believed. Updated via atomic word-level RMW per spec §5,
//! and swapped in under the volume's L2 lock on load/rebuild.
//!
//! Grounded on `alloc::bitmap`'s word-level helpers
//! (`find_first_zero`, `count_zeros`, `find_contiguous_zeros`), adapted
//! from plain `u64` words to the armored `(data, ecc)` pair the data model
//! calls for.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

pub const BITS_PER_WORD: usize = 64;

/// Single-bit-per-lane parity word: `ecc` holds the even parity of each bit
/// of `data` XORed with its two neighbors, letting a lone bit-flip in
/// either word be detected (not corrected — a detected mismatch forces a
/// conservative re-derivation from the on-disk bitmap during zero-scan).
#[inline]
fn compute_ecc(data: u64) -> u64 {
    data ^ data.rotate_left(1) ^ data.rotate_right(1)
}

struct ArmoredWord {
    data: AtomicU64,
    ecc: AtomicU64,
}

/// The in-RAM occupancy bitmap. One bit per block across `word_count`
/// armored 64-bit words.
pub struct OccupancyBitmap {
    words: Vec<ArmoredWord>,
    block_count: u64,
}

impl OccupancyBitmap {
    pub fn new(block_count: u64) -> Self {
        let word_count = ((block_count + 63) / 64) as usize;
        let mut words = Vec::with_capacity(word_count);
        words.resize_with(word_count, || ArmoredWord {
            data: AtomicU64::new(0),
            ecc: AtomicU64::new(compute_ecc(0)),
        });
        OccupancyBitmap { words, block_count }
    }

    /// Build directly from on-disk words (load path), recomputing ECC for
    /// each.
    pub fn from_words(words_in: &[u64], block_count: u64) -> Self {
        let words = words_in
            .iter()
            .map(|&w| ArmoredWord {
                data: AtomicU64::new(w),
                ecc: AtomicU64::new(compute_ecc(w)),
            })
            .collect();
        OccupancyBitmap { words, block_count }
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    fn locate(&self, block: u64) -> (usize, u32) {
        ((block / 64) as usize, (block % 64) as u32)
    }

    /// Read one bit. If the armor word disagrees with its ECC (bit rot in
    /// RAM), the bit is reported as set so the caller treats it
    /// conservatively as occupied rather than risking a double-allocation.
    pub fn test(&self, block: u64) -> bool {
        let (w, bit) = self.locate(block);
        let word = &self.words[w];
        let data = word.data.load(Ordering::Acquire);
        let ecc = word.ecc.load(Ordering::Acquire);
        if compute_ecc(data) != ecc {
            return true;
        }
        (data >> bit) & 1 != 0
    }

    pub fn set(&self, block: u64) {
        let (w, bit) = self.locate(block);
        let word = &self.words[w];
        let mut cur = word.data.load(Ordering::Acquire);
        loop {
            let next = cur | (1u64 << bit);
            match word
                .data
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    word.ecc.store(compute_ecc(next), Ordering::Release);
                    return;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn clear(&self, block: u64) {
        let (w, bit) = self.locate(block);
        let word = &self.words[w];
        let mut cur = word.data.load(Ordering::Acquire);
        loop {
            let next = cur & !(1u64 << bit);
            match word
                .data
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    word.ecc.store(compute_ecc(next), Ordering::Release);
                    return;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Flip a bit from clear to set during zero-scan resurrection (§4.9
    /// step 12). Returns `true` if the bit transitioned (was actually
    /// clear beforehand).
    pub fn resurrect(&self, block: u64) -> bool {
        let (w, bit) = self.locate(block);
        let word = &self.words[w];
        let mut cur = word.data.load(Ordering::Acquire);
        loop {
            if cur & (1u64 << bit) != 0 {
                return false;
            }
            let next = cur | (1u64 << bit);
            match word
                .data
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    word.ecc.store(compute_ecc(next), Ordering::Release);
                    return true;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn count_free(&self) -> u64 {
        self.words
            .iter()
            .map(|w| (!w.data.load(Ordering::Acquire)).count_ones() as u64)
            .sum()
    }

    pub fn find_first_free(&self, start: u64) -> Option<u64> {
        let (start_word, start_bit) = self.locate(start);
        for (i, word) in self.words.iter().enumerate().skip(start_word) {
            let data = word.data.load(Ordering::Acquire);
            let mask = if i == start_word {
                !0u64 << start_bit
            } else {
                !0u64
            };
            let candidates = !data & mask;
            if candidates != 0 {
                let bit = candidates.trailing_zeros() as u64;
                let block = (i as u64) * 64 + bit;
                if block < self.block_count {
                    return Some(block);
                }
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bitmap_is_all_free() {
        let bm = OccupancyBitmap::new(200);
        assert_eq!(bm.count_free(), 200);
        assert!(!bm.test(0));
    }

    #[test]
    fn set_and_clear_round_trip() {
        let bm = OccupancyBitmap::new(200);
        bm.set(5);
        assert!(bm.test(5));
        bm.clear(5);
        assert!(!bm.test(5));
    }

    #[test]
    fn resurrect_only_flips_clear_bits() {
        let bm = OccupancyBitmap::new(64);
        assert!(bm.resurrect(3));
        assert!(bm.test(3));
        assert!(!bm.resurrect(3));
    }

    #[test]
    fn find_first_free_skips_occupied() {
        let bm = OccupancyBitmap::new(64);
        bm.set(0);
        bm.set(1);
        assert_eq!(bm.find_first_free(0), Some(2));
    }

    #[test]
    fn ecc_mismatch_is_reported_as_occupied() {
        let bm = OccupancyBitmap::new(64);
        bm.words[0].ecc.store(0xdead_beef, Ordering::Release);
        assert!(bm.test(0));
    }
}
