//! Superblock Quorum, "Cardinal Vote" (C4, §4.3).
//!
//! Four replicas — North (LBA 0), East (~33%), West (~66%), South
//! (capacity minus superblock size, disabled below 16x the superblock
//! footprint) — are read, triaged for tampering, reduced to a single
//! winner by generation/timestamp/dirty-bit order, and optionally healed
//! back out to every replica slot.
//!
//! Grounded on `disk::superblock`'s shape: a packed raw
//! record with byte-offset comments, a `calculate_checksum`/`validate`
//! pair, and a thin `Superblock` wrapper with a dirty flag — re-expressed
//! with explicit little-endian encode/decode (per the design note in §9)
//! instead of `transmute`/`ptr::read`, and the location table generalized
//! from a fixed 8-primary/8-backup layout into the four
//! cardinal offsets this format uses.

use crate::crc32c::crc32c;
use crate::error::{EngineError, EngineResult};
use crate::hal::{BlockDevice, DeviceCaps, HwFlags, IoOp};
pub use crate::profile::FormatProfile;
use crate::types::{le, Address, Id128};
pub use crate::types::AddressWidth;

pub const SUPERBLOCK_SIZE: usize = 256;

const MAGIC: u64 = u64::from_le_bytes(*b"CRDNLVT1");

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_PROFILE: usize = 12;
const OFF_HWFLAGS: usize = 13;
const OFF_ENDIAN: usize = 14;
const OFF_ADDR_WIDTH: usize = 15;
const OFF_BLOCK_SIZE: usize = 16;
const OFF_UUID: usize = 24;
const OFF_TOTAL_CAPACITY: usize = 40;
const OFF_GENERATION: usize = 56;
const OFF_LAST_MOUNT_TIME: usize = 64;
const OFF_STATE_FLAGS: usize = 72;
const OFF_FEATURES_INCOMPAT: usize = 76;
const OFF_FEATURES_RO_COMPAT: usize = 80;
const OFF_FEATURES_COMPAT: usize = 84;
const OFF_EPOCH_START: usize = 88;
const OFF_CORTEX_START: usize = 96;
const OFF_BITMAP_START: usize = 104;
const OFF_QMASK_START: usize = 112;
const OFF_FLUX_START: usize = 120;
const OFF_HORIZON_START: usize = 128;
const OFF_STREAM_START: usize = 136;
const OFF_JOURNAL_START: usize = 144;
const OFF_JOURNAL_PTR: usize = 152;
const OFF_EPOCH_RING_BLOCK_IDX: usize = 160;
const OFF_CHECKSUM: usize = 252;

const _: () = assert!(OFF_CHECKSUM + 4 == SUPERBLOCK_SIZE);

/// Volume state flags (§3: clean/dirty/degraded/...).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StateFlags(pub u32);

impl StateFlags {
    pub const CLEAN: u32 = 1 << 0;
    pub const DIRTY: u32 = 1 << 1;
    pub const DEGRADED: u32 = 1 << 2;
    pub const PANIC: u32 = 1 << 3;
    pub const TOXIC: u32 = 1 << 4;
    pub const LOCKED: u32 = 1 << 5;
    pub const PENDING_WIPE: u32 = 1 << 6;
    pub const UNMOUNTING: u32 = 1 << 7;
    pub const METADATA_ZEROED: u32 = 1 << 8;
    pub const NEEDS_UPGRADE: u32 = 1 << 9;

    #[inline]
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }
    #[inline]
    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }
}

/// Region start LBAs, in the order the data model fixes them: epoch ring,
/// Cortex, allocation bitmap, Q-Mask, Flux, Horizon, stream tail, plus the
/// journal pointer pair used by the per-stripe WAL.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RegionLayout {
    pub epoch_start: u64,
    pub cortex_start: u64,
    pub bitmap_start: u64,
    pub qmask_start: u64,
    pub flux_start: u64,
    pub horizon_start: u64,
    pub stream_start: u64,
    pub journal_start: u64,
    pub journal_ptr: u64,
    pub epoch_ring_block_idx: u64,
}

impl RegionLayout {
    /// Each region start must be within `[0, total_capacity_sectors)` and
    /// regions must be monotonically ordered by start (§3 invariant).
    pub fn validate(&self, total_capacity_sectors: u128) -> bool {
        let starts = [
            self.epoch_start,
            self.cortex_start,
            self.bitmap_start,
            self.qmask_start,
            self.flux_start,
            self.horizon_start,
            self.stream_start,
        ];
        for &s in &starts {
            if (s as u128) >= total_capacity_sectors {
                return false;
            }
        }
        starts.windows(2).all(|w| w[0] <= w[1])
    }
}

fn pack_hw_flags(f: HwFlags) -> u8 {
    (f.rotational as u8)
        | ((f.zns_native as u8) << 1)
        | ((f.strict_flush as u8) << 2)
        | ((f.nvm_byte_addressable as u8) << 3)
        | ((f.gpu_direct as u8) << 4)
}

fn unpack_hw_flags(bits: u8) -> HwFlags {
    HwFlags {
        rotational: bits & 1 != 0,
        zns_native: bits & 2 != 0,
        strict_flush: bits & 4 != 0,
        nvm_byte_addressable: bits & 8 != 0,
        gpu_direct: bits & 16 != 0,
    }
}

/// A decoded superblock record.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Superblock {
    pub version: u32,
    pub profile: FormatProfile,
    pub hw_flags: HwFlags,
    pub address_width: AddressWidth,
    pub block_size: u32,
    pub uuid: Id128,
    pub total_capacity_sectors: u128,
    pub generation: u64,
    pub last_mount_time_ns: u64,
    pub state_flags: StateFlags,
    pub features_incompat: u32,
    pub features_ro_compat: u32,
    pub features_compat: u32,
    pub layout: RegionLayout,
}

impl Superblock {
    pub fn is_dirty(&self) -> bool {
        self.state_flags.contains(StateFlags::DIRTY)
    }

    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        le::write_u64(&mut buf, OFF_MAGIC, MAGIC);
        le::write_u32(&mut buf, OFF_VERSION, self.version);
        buf[OFF_PROFILE] = self.profile as u8;
        buf[OFF_HWFLAGS] = pack_hw_flags(self.hw_flags);
        buf[OFF_ENDIAN] = 0;
        buf[OFF_ADDR_WIDTH] = match self.address_width {
            AddressWidth::Narrow64 => 0,
            AddressWidth::Wide128 => 1,
        };
        le::write_u32(&mut buf, OFF_BLOCK_SIZE, self.block_size);
        le::write_u128(&mut buf, OFF_UUID, self.uuid.0);
        le::write_u128(&mut buf, OFF_TOTAL_CAPACITY, self.total_capacity_sectors);
        le::write_u64(&mut buf, OFF_GENERATION, self.generation);
        le::write_u64(&mut buf, OFF_LAST_MOUNT_TIME, self.last_mount_time_ns);
        le::write_u32(&mut buf, OFF_STATE_FLAGS, self.state_flags.0);
        le::write_u32(&mut buf, OFF_FEATURES_INCOMPAT, self.features_incompat);
        le::write_u32(&mut buf, OFF_FEATURES_RO_COMPAT, self.features_ro_compat);
        le::write_u32(&mut buf, OFF_FEATURES_COMPAT, self.features_compat);
        le::write_u64(&mut buf, OFF_EPOCH_START, self.layout.epoch_start);
        le::write_u64(&mut buf, OFF_CORTEX_START, self.layout.cortex_start);
        le::write_u64(&mut buf, OFF_BITMAP_START, self.layout.bitmap_start);
        le::write_u64(&mut buf, OFF_QMASK_START, self.layout.qmask_start);
        le::write_u64(&mut buf, OFF_FLUX_START, self.layout.flux_start);
        le::write_u64(&mut buf, OFF_HORIZON_START, self.layout.horizon_start);
        le::write_u64(&mut buf, OFF_STREAM_START, self.layout.stream_start);
        le::write_u64(&mut buf, OFF_JOURNAL_START, self.layout.journal_start);
        le::write_u64(&mut buf, OFF_JOURNAL_PTR, self.layout.journal_ptr);
        le::write_u64(
            &mut buf,
            OFF_EPOCH_RING_BLOCK_IDX,
            self.layout.epoch_ring_block_idx,
        );
        le::write_u32(&mut buf, OFF_CHECKSUM, 0);
        let checksum = crc32c(0, &buf);
        le::write_u32(&mut buf, OFF_CHECKSUM, checksum);
        buf
    }

    /// Decode and validate magic + checksum. `BadSuperblock` on magic
    /// mismatch, `DataRot` on checksum mismatch.
    pub fn decode(buf: &[u8; SUPERBLOCK_SIZE]) -> EngineResult<Self> {
        if le::read_u64(buf, OFF_MAGIC) != MAGIC {
            return Err(EngineError::BadSuperblock);
        }
        let stored = le::read_u32(buf, OFF_CHECKSUM);
        let mut check_buf = *buf;
        le::write_u32(&mut check_buf, OFF_CHECKSUM, 0);
        if crc32c(0, &check_buf) != stored {
            return Err(EngineError::DataRot);
        }
        let profile = FormatProfile::from_raw(buf[OFF_PROFILE]).ok_or(EngineError::BadSuperblock)?;
        let address_width = match buf[OFF_ADDR_WIDTH] {
            0 => AddressWidth::Narrow64,
            1 => AddressWidth::Wide128,
            _ => return Err(EngineError::BadSuperblock),
        };
        Ok(Superblock {
            version: le::read_u32(buf, OFF_VERSION),
            profile,
            hw_flags: unpack_hw_flags(buf[OFF_HWFLAGS]),
            address_width,
            block_size: le::read_u32(buf, OFF_BLOCK_SIZE),
            uuid: Id128(le::read_u128(buf, OFF_UUID)),
            total_capacity_sectors: le::read_u128(buf, OFF_TOTAL_CAPACITY),
            generation: le::read_u64(buf, OFF_GENERATION),
            last_mount_time_ns: le::read_u64(buf, OFF_LAST_MOUNT_TIME),
            state_flags: StateFlags(le::read_u32(buf, OFF_STATE_FLAGS)),
            features_incompat: le::read_u32(buf, OFF_FEATURES_INCOMPAT),
            features_ro_compat: le::read_u32(buf, OFF_FEATURES_RO_COMPAT),
            features_compat: le::read_u32(buf, OFF_FEATURES_COMPAT),
            layout: RegionLayout {
                epoch_start: le::read_u64(buf, OFF_EPOCH_START),
                cortex_start: le::read_u64(buf, OFF_CORTEX_START),
                bitmap_start: le::read_u64(buf, OFF_BITMAP_START),
                qmask_start: le::read_u64(buf, OFF_QMASK_START),
                flux_start: le::read_u64(buf, OFF_FLUX_START),
                horizon_start: le::read_u64(buf, OFF_HORIZON_START),
                stream_start: le::read_u64(buf, OFF_STREAM_START),
                journal_start: le::read_u64(buf, OFF_JOURNAL_START),
                journal_ptr: le::read_u64(buf, OFF_JOURNAL_PTR),
                epoch_ring_block_idx: le::read_u64(buf, OFF_EPOCH_RING_BLOCK_IDX),
            },
        })
    }
}

/// The four cardinal replica slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cardinal {
    North,
    East,
    West,
    South,
}

pub const CARDINALS: [Cardinal; 4] = [Cardinal::North, Cardinal::East, Cardinal::West, Cardinal::South];

fn ceil_div(a: u128, b: u128) -> u128 {
    (a + b - 1) / b
}

/// Byte offsets of the four cardinal replicas for a given candidate block
/// size, per §4.3 step 3. `South` is `None` when capacity is below 16x the
/// superblock footprint.
pub fn cardinal_byte_offsets(
    capacity_bytes: u128,
    block_size: u64,
    sb_size_bytes: u64,
) -> [Option<u128>; 4] {
    let north = Some(0u128);
    let east_target = ceil_div(capacity_bytes.saturating_mul(33), 100);
    let east = Some(ceil_div(east_target, block_size as u128) * block_size as u128);
    let west_target = ceil_div(capacity_bytes.saturating_mul(66), 100);
    let west = Some(ceil_div(west_target, block_size as u128) * block_size as u128);
    let south = if capacity_bytes >= 16 * sb_size_bytes as u128 {
        let south_block = (capacity_bytes - sb_size_bytes as u128) / block_size as u128;
        Some(south_block * block_size as u128)
    } else {
        None
    };
    [north, east, west, south]
}

const POISON_WORD: u32 = 0xFEED_FACE;

/// `true` if `sector` opens with four consecutive poison words, meaning
/// the device has been wiped rather than merely corrupted (§4.3 step 1).
pub fn is_poisoned(sector: &[u8]) -> bool {
    sector.len() >= 16
        && (0..4).all(|i| le::read_u32(sector, i * 4) == POISON_WORD)
}

/// Outcome of a candidate-ranking comparison in the best-candidate state
/// machine (§4.3 step 6).
fn better(a: &Superblock, b: &Superblock, replay_window_ns: u64) -> EngineResult<bool> {
    if a.generation != b.generation {
        return Ok(a.generation > b.generation);
    }
    let diff = a.last_mount_time_ns.abs_diff(b.last_mount_time_ns);
    if diff > replay_window_ns {
        return Err(EngineError::Tampered);
    }
    if a.last_mount_time_ns != b.last_mount_time_ns {
        return Ok(a.last_mount_time_ns > b.last_mount_time_ns);
    }
    Ok(a.is_dirty() && !b.is_dirty())
}

/// Candidate block sizes probed in order, per §4.3 step 2.
pub fn candidate_block_sizes(sector_size: u32, discovered: Option<u32>) -> alloc::vec::Vec<u32> {
    let mut v = alloc::vec![sector_size, 4096, 16384, 65536];
    if let Some(d) = discovered {
        if !v.contains(&d) {
            v.push(d);
        }
    }
    v
}

/// Run the Cardinal Vote: read every replica across every candidate block
/// size, triage for tampering, and return the winner. Does not perform the
/// heal phase (see [`heal`]).
pub fn execute_cardinal_vote<D: BlockDevice>(
    device: &D,
    sector_size: u32,
    sb_size_bytes: u64,
    replay_window_ns: u64,
) -> EngineResult<Superblock> {
    let caps: DeviceCaps = device.caps();
    let capacity_bytes = caps.total_capacity_sectors * sector_size as u128;

    let mut north_buf = alloc::vec![0u8; sector_size as usize];
    device.sync_io(IoOp::Read, Address::ZERO, &mut north_buf, 1)?;
    if is_poisoned(&north_buf) {
        return Err(EngineError::WipePending);
    }

    let discovered = Superblock::decode(
        north_buf[..SUPERBLOCK_SIZE]
            .try_into()
            .map_err(|_| EngineError::Geometry)?,
    )
    .ok()
    .map(|sb| sb.block_size);

    let mut winner: Option<Superblock> = None;

    for block_size in candidate_block_sizes(sector_size, discovered) {
        let offsets = cardinal_byte_offsets(capacity_bytes, block_size as u64, sb_size_bytes);
        let slots: [(Cardinal, Option<u128>); 4] = [
            (Cardinal::North, offsets[0]),
            (Cardinal::East, offsets[1]),
            (Cardinal::West, offsets[2]),
            (Cardinal::South, offsets[3]),
        ];
        for (slot, off) in slots {
            if caps.flags.zns_native && slot != Cardinal::North {
                continue;
            }
            let Some(byte_off) = off else { continue };
            if byte_off % sector_size as u128 != 0 {
                continue;
            }
            let lba = Address::new128(byte_off / sector_size as u128);
            let mut buf = alloc::vec![0u8; sector_size as usize];
            if device.sync_io(IoOp::Read, lba, &mut buf, 1).is_err() {
                continue;
            }
            let Ok(raw): Result<[u8; SUPERBLOCK_SIZE], _> = buf[..SUPERBLOCK_SIZE].try_into()
            else {
                continue;
            };
            let Ok(candidate) = Superblock::decode(&raw) else {
                continue;
            };
            if candidate.block_size != block_size {
                continue;
            }

            winner = match winner {
                None => Some(candidate),
                Some(w) => {
                    if w.uuid == candidate.uuid && w.generation == candidate.generation && w != candidate {
                        return Err(EngineError::Tampered);
                    }
                    if w.uuid != candidate.uuid && w.generation == candidate.generation {
                        return Err(EngineError::Tampered);
                    }
                    if better(&candidate, &w, replay_window_ns)? {
                        Some(candidate)
                    } else {
                        Some(w)
                    }
                }
            };
        }
    }

    winner.ok_or(EngineError::BadSuperblock)
}

/// Heal phase (§4.3 step 7): write the winning superblock out to every
/// replica slot that is missing, stale, or time-divergent beyond `10 *
/// replay_window_ns`. Returns the count of replicas rewritten.
pub fn heal<D: BlockDevice>(
    device: &D,
    winner: &Superblock,
    sector_size: u32,
    sb_size_bytes: u64,
    replay_window_ns: u64,
) -> EngineResult<u32> {
    let caps = device.caps();
    let capacity_bytes = caps.total_capacity_sectors * sector_size as u128;
    let offsets = cardinal_byte_offsets(
        capacity_bytes,
        winner.block_size as u64,
        sb_size_bytes,
    );
    let encoded = winner.encode();
    let mut healed = 0u32;

    for (slot, off) in CARDINALS.into_iter().zip(offsets) {
        if caps.flags.zns_native && slot != Cardinal::North {
            continue;
        }
        let Some(byte_off) = off else { continue };
        if byte_off % sector_size as u128 != 0 {
            continue;
        }
        let lba = Address::new128(byte_off / sector_size as u128);
        let mut buf = alloc::vec![0u8; sector_size as usize];
        let needs_heal = match device.sync_io(IoOp::Read, lba, &mut buf, 1) {
            Err(_) => true,
            Ok(()) => match buf[..SUPERBLOCK_SIZE].try_into().ok().and_then(|r: [u8; SUPERBLOCK_SIZE]| Superblock::decode(&r).ok()) {
                None => true,
                Some(existing) => {
                    existing.generation != winner.generation
                        || existing
                            .last_mount_time_ns
                            .abs_diff(winner.last_mount_time_ns)
                            > 10 * replay_window_ns
                }
            },
        };
        if !needs_heal {
            continue;
        }
        let mut out = alloc::vec![0u8; sector_size as usize];
        out[..SUPERBLOCK_SIZE].copy_from_slice(&encoded);
        device.sync_io(IoOp::Write, lba, &mut out, 1)?;
        device.barrier()?;
        let mut verify = alloc::vec![0u8; sector_size as usize];
        device.sync_io(IoOp::Read, lba, &mut verify, 1)?;
        if verify[..SUPERBLOCK_SIZE] != out[..SUPERBLOCK_SIZE] {
            return Err(EngineError::HwIo);
        }
        healed += 1;
    }
    Ok(healed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MemoryDevice;

    fn sample_sb(generation: u64, dirty: bool, block_size: u32, capacity_sectors: u128) -> Superblock {
        let mut state = StateFlags::default();
        if dirty {
            state.set(StateFlags::DIRTY);
        } else {
            state.set(StateFlags::CLEAN);
        }
        Superblock {
            version: 1,
            profile: FormatProfile::Generic,
            hw_flags: HwFlags::default(),
            address_width: AddressWidth::Narrow64,
            block_size,
            uuid: Id128(42),
            total_capacity_sectors: capacity_sectors,
            generation,
            last_mount_time_ns: 1_000,
            state_flags: state,
            features_incompat: 0,
            features_ro_compat: 0,
            features_compat: 0,
            layout: RegionLayout::default(),
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let sb = sample_sb(7, true, 4096, 1_000_000);
        let buf = sb.encode();
        let decoded = Superblock::decode(&buf).unwrap();
        assert_eq!(decoded, sb);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = sample_sb(1, false, 4096, 1000).encode();
        buf[0] ^= 0xFF;
        assert_eq!(Superblock::decode(&buf), Err(EngineError::BadSuperblock));
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let mut buf = sample_sb(1, false, 4096, 1000).encode();
        buf[40] ^= 0xFF;
        assert_eq!(Superblock::decode(&buf), Err(EngineError::DataRot));
    }

    #[test]
    fn higher_generation_wins() {
        let low = sample_sb(1, false, 4096, 1000);
        let high = sample_sb(2, false, 4096, 1000);
        assert!(better(&high, &low, 5_000_000_000).unwrap());
        assert!(!better(&low, &high, 5_000_000_000).unwrap());
    }

    #[test]
    fn equal_generation_outside_replay_window_is_tampered() {
        let mut a = sample_sb(1, false, 4096, 1000);
        let mut b = a;
        a.last_mount_time_ns = 0;
        b.last_mount_time_ns = 1_000_000_000;
        assert_eq!(better(&a, &b, 1000), Err(EngineError::Tampered));
    }

    #[test]
    fn dirty_replica_preferred_on_full_tie() {
        let mut clean = sample_sb(1, false, 4096, 1000);
        let mut dirty = sample_sb(1, true, 4096, 1000);
        clean.last_mount_time_ns = 500;
        dirty.last_mount_time_ns = 500;
        assert!(better(&dirty, &clean, 1_000_000).unwrap());
    }

    #[test]
    fn poison_pattern_is_detected() {
        let mut sector = alloc::vec![0u8; 32];
        for i in 0..4 {
            le::write_u32(&mut sector, i * 4, POISON_WORD);
        }
        assert!(is_poisoned(&sector));
        sector[0] = 0;
        assert!(!is_poisoned(&sector));
    }

    #[test]
    fn cardinal_vote_recovers_winner_after_device_round_trip() {
        let sector_size = 512u32;
        let capacity_sectors = 200_000u128;
        let dev = MemoryDevice::new(sector_size, capacity_sectors as u64);
        let sb = sample_sb(3, false, sector_size, capacity_sectors);

        let offsets = cardinal_byte_offsets(
            capacity_sectors * sector_size as u128,
            sector_size as u64,
            SUPERBLOCK_SIZE as u64,
        );
        let encoded = sb.encode();
        for off in offsets.into_iter().flatten() {
            let lba = Address::new128(off / sector_size as u128);
            let mut buf = alloc::vec![0u8; sector_size as usize];
            buf[..SUPERBLOCK_SIZE].copy_from_slice(&encoded);
            dev.sync_io(IoOp::Write, lba, &mut buf, 1).unwrap();
        }

        let winner = execute_cardinal_vote(&dev, sector_size, SUPERBLOCK_SIZE as u64, 5_000_000_000)
            .unwrap();
        assert_eq!(winner.generation, 3);
        assert_eq!(winner.uuid, sb.uuid);
    }
}
