//! Q-Mask: per-block 2-bit quality lattice (C7).
//!
//! Four states form a monotonic lattice `Toxic < Bronze < Silver < Gold`.
//! A block's mask only ever moves up via successful Auto-Medic repair or
//! down via a detected integrity failure; it never skips Toxic on the way
//! down, since any detected fault is conservatively treated as the worst
//! case until a full repair cycle re-verifies it. Transitions are applied
//! with a compare-and-swap loop on the packed 2-bit word, matching the
//! atomics-based bitmap word updates in `alloc/bitmap.rs`.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum QMask {
    Toxic = 0,
    Bronze = 1,
    Silver = 2,
    Gold = 3,
}

impl QMask {
    #[inline]
    pub fn from_bits(bits: u8) -> QMask {
        match bits & 0b11 {
            0 => QMask::Toxic,
            1 => QMask::Bronze,
            2 => QMask::Silver,
            _ => QMask::Gold,
        }
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// One step up the lattice, saturating at `Gold`.
    #[inline]
    pub fn promote(self) -> QMask {
        QMask::from_bits((self.bits() + 1).min(QMask::Gold.bits()))
    }
}

/// 32 Q-Mask entries (2 bits each) packed into one atomic word, one table
/// entry per 32 consecutive blocks. Indexed the same way
/// bitmap words: `block / 32` selects the word, `block % 32` selects the
/// 2-bit lane within it.
pub struct QMaskTable {
    words: alloc::vec::Vec<AtomicU64>,
}

impl QMaskTable {
    pub fn new(block_count: u64) -> Self {
        let word_count = ((block_count + 31) / 32) as usize;
        let mut words = alloc::vec::Vec::with_capacity(word_count);
        words.resize_with(word_count, || AtomicU64::new(0));
        QMaskTable { words }
    }

    fn locate(block: u64) -> (usize, u32) {
        ((block / 32) as usize, ((block % 32) * 2) as u32)
    }

    pub fn get(&self, block: u64) -> QMask {
        let (w, shift) = Self::locate(block);
        let word = self.words[w].load(Ordering::Acquire);
        QMask::from_bits(((word >> shift) & 0b11) as u8)
    }

    /// Atomically replace the mask for `block`, retrying on CAS contention.
    pub fn set(&self, block: u64, new: QMask) {
        let (w, shift) = Self::locate(block);
        let atom = &self.words[w];
        let mut cur = atom.load(Ordering::Acquire);
        loop {
            let cleared = cur & !(0b11u64 << shift);
            let next = cleared | ((new.bits() as u64) << shift);
            match atom.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Promote one step up the lattice, returning the mask actually
    /// installed. Used after a successful Auto-Medic verify pass.
    pub fn promote(&self, block: u64) -> QMask {
        let (w, shift) = Self::locate(block);
        let atom = &self.words[w];
        let mut cur = atom.load(Ordering::Acquire);
        loop {
            let existing = QMask::from_bits(((cur >> shift) & 0b11) as u8);
            let promoted = existing.promote();
            let cleared = cur & !(0b11u64 << shift);
            let next = cleared | ((promoted.bits() as u64) << shift);
            match atom.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return promoted,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Force a block down to `Toxic`. Used the moment any integrity check
    /// fails, per the "never skip Toxic on the way down" rule.
    pub fn demote_to_toxic(&self, block: u64) {
        self.set(block, QMask::Toxic);
    }

    /// Apply `f` to the current mask under a CAS loop bounded to
    /// `max_attempts`, for callers that must surface contention as an
    /// error rather than spin forever (Auto-Medic's repair path). Returns
    /// the mask actually installed, or `Err(())` once every attempt has
    /// lost the race.
    pub fn try_transition(
        &self,
        block: u64,
        f: impl Fn(QMask) -> QMask,
        max_attempts: u32,
    ) -> Result<QMask, ()> {
        let (w, shift) = Self::locate(block);
        let atom = &self.words[w];
        let mut cur = atom.load(Ordering::Acquire);
        for _ in 0..max_attempts {
            let existing = QMask::from_bits(((cur >> shift) & 0b11) as u8);
            let next_mask = f(existing);
            let cleared = cur & !(0b11u64 << shift);
            let next = cleared | ((next_mask.bits() as u64) << shift);
            match atom.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(next_mask),
                Err(observed) => cur = observed,
            }
        }
        Err(())
    }
}
