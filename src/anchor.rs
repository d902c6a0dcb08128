//! Anchor record and the Cortex table that holds them (§3 data model).
//!
//! An anchor is a fixed 128-byte identity record: seed-id is the immutable
//! identity, public-id is mutable, and the remaining fields describe where
//! and how the object's data blocks are placed (gravity-center, orbit
//! vector, fractal-scale) plus its lifecycle state (data-class, write-gen,
//! mass). Encoding follows the explicit-little-endian contract in
//! `types::le` rather than struct aliasing, per the design note in §9.
//!
//! Grounded on the `disk::superblock::SuperblockRaw` shape (byte
//! offset comments, a `calculate_checksum`/`validate` pair, a thin wrapper
//! struct layered over the raw record) but re-expressed without
//! `transmute`/`ptr::read`, and on a hashed bucket-table style
//! for the Cortex slot table itself.

use crate::crc32c::crc32c;
use crate::error::{EngineError, EngineResult};
use crate::hash::id_to_index;
use crate::types::{le, Id128};
use alloc::vec::Vec;

pub const ANCHOR_SIZE: usize = 128;

const OFF_SEED_ID: usize = 0;
const OFF_PUBLIC_ID: usize = 16;
const OFF_MOD_CLOCK: usize = 32;
const OFF_CREATE_CLOCK: usize = 40;
const OFF_GRAVITY_CENTER: usize = 44;
const OFF_ORBIT_VECTOR: usize = 52; // 6 bytes
const OFF_FRACTAL_SCALE: usize = 58;
const OFF_WRITE_GEN: usize = 60;
const OFF_MASS: usize = 64;
const OFF_DATA_CLASS: usize = 72;
const OFF_PERMISSIONS: usize = 80;
const OFF_ORBIT_HINTS: usize = 84;
const OFF_INLINE_BUFFER: usize = 88; // 36 bytes
const INLINE_BUFFER_LEN: usize = 36;
const OFF_CHECKSUM: usize = 124;

static_assertions::const_assert!(OFF_CHECKSUM + 4 == ANCHOR_SIZE);

/// `data_class` bit layout: low bits are flags, a class subfield occupies
/// bits 8..16.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DataClass(pub u64);

impl DataClass {
    pub const VALID: u64 = 1 << 0;
    pub const TOMBSTONE: u64 = 1 << 1;
    pub const NANO: u64 = 1 << 2;
    pub const HORIZON: u64 = 1 << 3;
    pub const ENCRYPTED: u64 = 1 << 4;
    pub const STATIC: u64 = 1 << 5;
    const CLASS_SHIFT: u32 = 8;
    const CLASS_MASK: u64 = 0xFF << Self::CLASS_SHIFT;

    #[inline]
    pub fn contains(self, flag: u64) -> bool {
        self.0 & flag != 0
    }
    #[inline]
    pub fn set(&mut self, flag: u64) {
        self.0 |= flag;
    }
    #[inline]
    pub fn clear(&mut self, flag: u64) {
        self.0 &= !flag;
    }
    #[inline]
    pub fn class_subfield(self) -> u8 {
        ((self.0 & Self::CLASS_MASK) >> Self::CLASS_SHIFT) as u8
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const EXEC: u32 = 1 << 2;
    pub const IMMUTABLE: u32 = 1 << 3;
    pub const SOVEREIGN: u32 = 1 << 4;

    #[inline]
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// `spec.md` §4.7 step 2: read is allowed if the anchor or the session
    /// carries `read` or `sovereign`.
    pub fn permits_read(self, session: Permissions) -> bool {
        let mask = Self::READ | Self::SOVEREIGN;
        self.0 & mask != 0 || session.0 & mask != 0
    }
}

/// A decoded 128-byte Cortex record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Anchor {
    pub seed_id: Id128,
    pub public_id: Id128,
    pub mod_clock: u64,
    pub create_clock: u32,
    pub gravity_center: u64,
    pub orbit_vector: [u8; 6],
    pub fractal_scale: u16,
    pub write_gen: u32,
    pub mass: u64,
    pub data_class: DataClass,
    pub permissions: Permissions,
    pub orbit_hints: u32,
    pub inline_buffer: [u8; INLINE_BUFFER_LEN],
}

impl Anchor {
    pub fn empty() -> Self {
        Anchor {
            seed_id: Id128::ZERO,
            public_id: Id128::ZERO,
            mod_clock: 0,
            create_clock: 0,
            gravity_center: 0,
            orbit_vector: [0; 6],
            fractal_scale: 0,
            write_gen: 0,
            mass: 0,
            data_class: DataClass::default(),
            permissions: Permissions::default(),
            orbit_hints: 0,
            inline_buffer: [0; INLINE_BUFFER_LEN],
        }
    }

    pub fn is_empty_slot(&self) -> bool {
        self.seed_id == Id128::ZERO && !self.data_class.contains(DataClass::VALID)
    }

    pub fn is_tombstone(&self) -> bool {
        self.data_class.contains(DataClass::TOMBSTONE)
    }

    /// 2 bits per cluster-of-16-blocks orbit hint, cluster = block_index >> 4.
    pub fn orbit_hint_for_block(&self, block_index: u64) -> u8 {
        let cluster = (block_index >> 4) & 0xF;
        ((self.orbit_hints >> (cluster * 2)) & 0b11) as u8
    }

    pub fn set_orbit_hint_for_block(&mut self, block_index: u64, orbit: u8) {
        let cluster = (block_index >> 4) & 0xF;
        let shift = cluster * 2;
        self.orbit_hints &= !(0b11 << shift);
        self.orbit_hints |= ((orbit & 0b11) as u32) << shift;
    }

    /// Serialize to a 128-byte buffer with `checksum` computed over the
    /// record with the checksum field zeroed, per §4.4's genesis-write
    /// recipe (reused by every anchor write, not just the root).
    pub fn encode(&self) -> [u8; ANCHOR_SIZE] {
        let mut buf = [0u8; ANCHOR_SIZE];
        le::write_u128(&mut buf, OFF_SEED_ID, self.seed_id.0);
        le::write_u128(&mut buf, OFF_PUBLIC_ID, self.public_id.0);
        le::write_u64(&mut buf, OFF_MOD_CLOCK, self.mod_clock);
        le::write_u32(&mut buf, OFF_CREATE_CLOCK, self.create_clock);
        le::write_u64(&mut buf, OFF_GRAVITY_CENTER, self.gravity_center);
        buf[OFF_ORBIT_VECTOR..OFF_ORBIT_VECTOR + 6].copy_from_slice(&self.orbit_vector);
        le::write_u16(&mut buf, OFF_FRACTAL_SCALE, self.fractal_scale);
        le::write_u32(&mut buf, OFF_WRITE_GEN, self.write_gen);
        le::write_u64(&mut buf, OFF_MASS, self.mass);
        le::write_u64(&mut buf, OFF_DATA_CLASS, self.data_class.0);
        le::write_u32(&mut buf, OFF_PERMISSIONS, self.permissions.0);
        le::write_u32(&mut buf, OFF_ORBIT_HINTS, self.orbit_hints);
        buf[OFF_INLINE_BUFFER..OFF_INLINE_BUFFER + INLINE_BUFFER_LEN]
            .copy_from_slice(&self.inline_buffer);
        le::write_u32(&mut buf, OFF_CHECKSUM, 0);
        let checksum = crc32c(0, &buf);
        le::write_u32(&mut buf, OFF_CHECKSUM, checksum);
        buf
    }

    /// Decode and validate the embedded checksum. Returns `DataRot` if the
    /// checksum does not match (spec §4.4 verify step).
    pub fn decode(buf: &[u8; ANCHOR_SIZE]) -> EngineResult<Self> {
        let stored = le::read_u32(buf, OFF_CHECKSUM);
        let mut check_buf = *buf;
        le::write_u32(&mut check_buf, OFF_CHECKSUM, 0);
        if crc32c(0, &check_buf) != stored {
            return Err(EngineError::DataRot);
        }
        let mut orbit_vector = [0u8; 6];
        orbit_vector.copy_from_slice(&buf[OFF_ORBIT_VECTOR..OFF_ORBIT_VECTOR + 6]);
        let mut inline_buffer = [0u8; INLINE_BUFFER_LEN];
        inline_buffer
            .copy_from_slice(&buf[OFF_INLINE_BUFFER..OFF_INLINE_BUFFER + INLINE_BUFFER_LEN]);
        Ok(Anchor {
            seed_id: Id128(le::read_u128(buf, OFF_SEED_ID)),
            public_id: Id128(le::read_u128(buf, OFF_PUBLIC_ID)),
            mod_clock: le::read_u64(buf, OFF_MOD_CLOCK),
            create_clock: le::read_u32(buf, OFF_CREATE_CLOCK),
            gravity_center: le::read_u64(buf, OFF_GRAVITY_CENTER),
            orbit_vector,
            fractal_scale: le::read_u16(buf, OFF_FRACTAL_SCALE),
            write_gen: le::read_u32(buf, OFF_WRITE_GEN),
            mass: le::read_u64(buf, OFF_MASS),
            data_class: DataClass(le::read_u64(buf, OFF_DATA_CLASS)),
            permissions: Permissions(le::read_u32(buf, OFF_PERMISSIONS)),
            orbit_hints: le::read_u32(buf, OFF_ORBIT_HINTS),
            inline_buffer,
        })
    }
}

/// The Cortex table: a flat slab of [`Anchor`] slots, addressed by
/// SplitMix64-hashed seed-id with linear probing on collision.
pub struct CortexTable {
    slots: Vec<Anchor>,
    probe_depth: u16,
}

impl CortexTable {
    pub fn new(capacity: usize, probe_depth: u16) -> Self {
        CortexTable {
            slots: alloc::vec![Anchor::empty(); capacity],
            probe_depth,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn home_slot(&self, seed_id: Id128) -> usize {
        id_to_index(seed_id.hi(), seed_id.lo(), self.slots.len() as u64) as usize
    }

    /// Insert a new anchor, linear-probing from its hashed home slot up to
    /// `probe_depth` steps. Fails with `Enospc` if no slot is found.
    pub fn insert(&mut self, anchor: Anchor) -> EngineResult<usize> {
        let home = self.home_slot(anchor.seed_id);
        let cap = self.slots.len();
        for step in 0..self.probe_depth as usize {
            let idx = (home + step) % cap;
            if self.slots[idx].is_empty_slot() || self.slots[idx].is_tombstone() {
                self.slots[idx] = anchor;
                return Ok(idx);
            }
        }
        Err(EngineError::Enospc)
    }

    /// Find the slot holding `seed_id`, if present and not tombstoned.
    pub fn find(&self, seed_id: Id128) -> Option<usize> {
        let home = self.home_slot(seed_id);
        let cap = self.slots.len();
        for step in 0..self.probe_depth as usize {
            let idx = (home + step) % cap;
            let slot = &self.slots[idx];
            if slot.is_empty_slot() {
                return None;
            }
            if slot.seed_id == seed_id && !slot.is_tombstone() {
                return Some(idx);
            }
        }
        None
    }

    pub fn get(&self, idx: usize) -> &Anchor {
        &self.slots[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Anchor {
        &mut self.slots[idx]
    }

    /// Logical delete: set the tombstone flag, matching §3's "logically
    /// deleted via tombstone flag" lifecycle rule.
    pub fn tombstone(&mut self, seed_id: Id128) -> EngineResult<()> {
        let idx = self.find(seed_id).ok_or(EngineError::NotFound)?;
        self.slots[idx].data_class.set(DataClass::TOMBSTONE);
        Ok(())
    }

    pub fn iter_valid(&self) -> impl Iterator<Item = &Anchor> {
        self.slots
            .iter()
            .filter(|a| a.data_class.contains(DataClass::VALID) && !a.is_tombstone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u128) -> Anchor {
        let mut a = Anchor::empty();
        a.seed_id = Id128(seed);
        a.data_class.set(DataClass::VALID);
        a.mass = 4096;
        a
    }

    #[test]
    fn encode_decode_round_trips() {
        let a = sample(0xdead_beef_cafe_babe_1122_3344_5566_7788);
        let buf = a.encode();
        let decoded = Anchor::decode(&buf).unwrap();
        assert_eq!(decoded, a);
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let a = sample(77);
        let mut buf = a.encode();
        buf[0] ^= 0xFF;
        assert_eq!(Anchor::decode(&buf), Err(EngineError::DataRot));
    }

    #[test]
    fn insert_and_find_round_trip() {
        let mut table = CortexTable::new(64, 8);
        let a = sample(123);
        let idx = table.insert(a).unwrap();
        assert_eq!(table.find(a.seed_id), Some(idx));
    }

    #[test]
    fn tombstoned_anchor_is_not_found() {
        let mut table = CortexTable::new(64, 8);
        let a = sample(9001);
        table.insert(a).unwrap();
        table.tombstone(a.seed_id).unwrap();
        assert_eq!(table.find(a.seed_id), None);
    }

    #[test]
    fn orbit_hint_round_trips_per_cluster() {
        let mut a = Anchor::empty();
        a.set_orbit_hint_for_block(0, 3);
        a.set_orbit_hint_for_block(16, 1);
        assert_eq!(a.orbit_hint_for_block(0), 3);
        assert_eq!(a.orbit_hint_for_block(16), 1);
        assert_eq!(a.orbit_hint_for_block(1), 3);
    }

    #[test]
    fn insert_fails_when_table_is_full() {
        let mut table = CortexTable::new(2, 2);
        table.insert(sample(1)).unwrap();
        table.insert(sample(2)).unwrap();
        assert_eq!(table.insert(sample(3)), Err(EngineError::Enospc));
    }
}
