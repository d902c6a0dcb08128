//! Epoch Ring: monotonic generation log with drift classification (C3,
//! §4.2).
//!
//! A small ring of fixed records tracks a logical "epoch id" that the
//! in-memory volume and the on-disk ring can independently advance;
//! `check_ring` classifies how far apart they've drifted (including
//! wrap-around near `u64::MAX`) into an outcome ranging from `Ok` through
//! two severities each of "disk ahead" and "memory ahead".
//!
//! Grounded on `journal::wal`'s ring-position arithmetic
//! (block-index/geometry conversion, ring wraparound), generalized from a
//! write-ahead log to a generation counter ring per §4.2's contract.

use crate::crc32c::crc32c;
use crate::error::{EngineError, EngineResult};
use crate::hal::{BlockDevice, IoOp};
use crate::types::{le, Address};

pub const EPOCH_RECORD_SIZE: usize = 32;
const MAGIC: u32 = u32::from_le_bytes(*b"EPCH");

const OFF_MAGIC: usize = 0;
const OFF_EPOCH_ID: usize = 4;
const OFF_TIMESTAMP: usize = 12;
const OFF_FLAGS: usize = 20;
const OFF_D0_ROOT_CHECKSUM: usize = 24;
const OFF_CRC: usize = 28;

const _: () = assert!(OFF_CRC + 4 == EPOCH_RECORD_SIZE);

const WRAP_THRESHOLD: u64 = 1 << 20;
const FUTURE_TOXIC_THRESHOLD: u64 = 5000;
const PAST_TOXIC_THRESHOLD: u64 = 100;
/// Generation headroom reserved near the top of the `u64` range (§4.2
/// advance: "refuse when generation exceeds this").
const GENERATION_CEILING: u64 = 0xFFFF_FFFF_FFFF_FFF0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EpochRecord {
    pub epoch_id: u64,
    pub timestamp_ns: u64,
    pub flags: u32,
    pub d0_root_checksum: u32,
}

impl EpochRecord {
    pub fn encode(&self) -> [u8; EPOCH_RECORD_SIZE] {
        let mut buf = [0u8; EPOCH_RECORD_SIZE];
        le::write_u32(&mut buf, OFF_MAGIC, MAGIC);
        le::write_u64(&mut buf, OFF_EPOCH_ID, self.epoch_id);
        le::write_u64(&mut buf, OFF_TIMESTAMP, self.timestamp_ns);
        le::write_u32(&mut buf, OFF_FLAGS, self.flags);
        le::write_u32(&mut buf, OFF_D0_ROOT_CHECKSUM, self.d0_root_checksum);
        let crc = crc32c(0, &buf[..OFF_CRC]);
        le::write_u32(&mut buf, OFF_CRC, crc);
        buf
    }

    pub fn decode(buf: &[u8; EPOCH_RECORD_SIZE]) -> EngineResult<Self> {
        if le::read_u32(buf, OFF_MAGIC) != MAGIC {
            return Err(EngineError::EpochLost);
        }
        let stored = le::read_u32(buf, OFF_CRC);
        if crc32c(0, &buf[..OFF_CRC]) != stored {
            return Err(EngineError::DataRot);
        }
        Ok(EpochRecord {
            epoch_id: le::read_u64(buf, OFF_EPOCH_ID),
            timestamp_ns: le::read_u64(buf, OFF_TIMESTAMP),
            flags: le::read_u32(buf, OFF_FLAGS),
            d0_root_checksum: le::read_u32(buf, OFF_D0_ROOT_CHECKSUM),
        })
    }
}

/// Outcome of [`check_ring`]'s drift classification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriftOutcome {
    Ok,
    TimeDilation,
    MediaToxicFuture,
    GenerationSkew,
    MediaToxicPast,
}

impl DriftOutcome {
    pub fn into_error(self) -> Option<EngineError> {
        match self {
            DriftOutcome::Ok => None,
            DriftOutcome::TimeDilation => Some(EngineError::TimeDilation),
            DriftOutcome::MediaToxicFuture | DriftOutcome::MediaToxicPast => {
                Some(EngineError::MediaToxic)
            }
            DriftOutcome::GenerationSkew => Some(EngineError::GenerationSkew),
        }
    }
}

/// Circular distance between `disk_id` and `mem_id`, preferring the short
/// way around near the `u64` wrap boundary.
fn circular_diff(disk_id: u64, mem_id: u64) -> (u64, bool) {
    let disk_near_max = disk_id >= u64::MAX - WRAP_THRESHOLD;
    let mem_near_zero = mem_id <= WRAP_THRESHOLD;
    let mem_near_max = mem_id >= u64::MAX - WRAP_THRESHOLD;
    let disk_near_zero = disk_id <= WRAP_THRESHOLD;

    if disk_near_max && mem_near_zero {
        let wrapped = (u64::MAX - disk_id) + mem_id + 1;
        return (wrapped, true);
    }
    if mem_near_max && disk_near_zero {
        let wrapped = (u64::MAX - mem_id) + disk_id + 1;
        return (wrapped, false);
    }
    if disk_id >= mem_id {
        (disk_id - mem_id, true)
    } else {
        (mem_id - disk_id, false)
    }
}

/// Classify the drift between the on-disk epoch id and the in-memory one.
pub fn check_ring(disk_id: u64, mem_id: u64) -> DriftOutcome {
    let (diff, disk_ahead) = circular_diff(disk_id, mem_id);
    if diff == 0 {
        return DriftOutcome::Ok;
    }
    if disk_ahead {
        if diff <= FUTURE_TOXIC_THRESHOLD {
            DriftOutcome::TimeDilation
        } else {
            DriftOutcome::MediaToxicFuture
        }
    } else if diff <= PAST_TOXIC_THRESHOLD {
        DriftOutcome::GenerationSkew
    } else {
        DriftOutcome::MediaToxicPast
    }
}

/// Converts a ring block index to a sector LBA, failing `Geometry` on
/// overflow or out-of-range placement (§4.2's shared geometry mapping).
pub fn block_to_lba(
    ring_start_lba: u64,
    block_index: u64,
    sectors_per_block: u64,
    block_size: u64,
    capacity_bytes: u128,
) -> EngineResult<Address> {
    let byte_offset = (block_index as u128)
        .checked_mul(block_size as u128)
        .ok_or(EngineError::Geometry)?;
    if byte_offset >= capacity_bytes {
        return Err(EngineError::Geometry);
    }
    let lba = ring_start_lba
        .checked_add(block_index.checked_mul(sectors_per_block).ok_or(EngineError::Geometry)?)
        .ok_or(EngineError::Geometry)?;
    Ok(Address::new(lba))
}

/// Write the ring's first record (epoch 0) at format time, per §4.2's
/// three-operation contract. Mirrors [`crate::root_anchor::write_genesis`]'s
/// shape: fill well-known defaults, checksum last, write, barrier.
pub fn write_genesis<D: BlockDevice>(
    device: &D,
    ring_start_lba: u64,
    sectors_per_block: u64,
    block_size: u64,
    now_ns: u64,
) -> EngineResult<()> {
    if sectors_per_block == 0 {
        return Err(EngineError::Geometry);
    }
    let record = EpochRecord {
        epoch_id: 0,
        timestamp_ns: now_ns,
        flags: 0,
        d0_root_checksum: 0,
    };
    let sector_size = (block_size / sectors_per_block) as usize;
    if sector_size < EPOCH_RECORD_SIZE {
        return Err(EngineError::Geometry);
    }
    let mut buf = alloc::vec![0u8; sector_size];
    buf[..EPOCH_RECORD_SIZE].copy_from_slice(&record.encode());
    device.sync_io(IoOp::Write, Address::new(ring_start_lba), &mut buf, 1)?;
    device.barrier()
}

pub struct AdvanceOutcome {
    pub new_epoch_id: u64,
    pub new_block_index: u64,
}

/// Write the next epoch record, wrapping the ring. Refuses
/// (`GenerationSkew`, reused to mean "exhausted headroom") once the
/// generation nears `u64::MAX`.
pub fn advance<D: BlockDevice>(
    device: &D,
    ring_start_lba: u64,
    ring_size_bytes: u64,
    block_size: u64,
    sectors_per_block: u64,
    capacity_bytes: u128,
    current_epoch_id: u64,
    current_block_index: u64,
    ro: bool,
    now_ns: u64,
) -> EngineResult<AdvanceOutcome> {
    if ro {
        return Err(EngineError::AccessDenied);
    }
    if current_epoch_id > GENERATION_CEILING {
        return Err(EngineError::GenerationSkew);
    }
    let ring_len_blocks = (ring_size_bytes + block_size - 1) / block_size;
    if ring_len_blocks == 0 {
        return Err(EngineError::Geometry);
    }
    let next_block_index = (current_block_index + 1) % ring_len_blocks;
    let next_epoch_id = current_epoch_id + 1;

    let mut current_field_buf = [0u8; 8];
    current_field_buf.copy_from_slice(&current_epoch_id.to_le_bytes());
    let d0_root_checksum = crc32c(0, &current_field_buf);

    let record = EpochRecord {
        epoch_id: next_epoch_id,
        timestamp_ns: now_ns,
        flags: 0,
        d0_root_checksum,
    };

    let lba = block_to_lba(
        ring_start_lba,
        next_block_index,
        sectors_per_block,
        block_size,
        capacity_bytes,
    )?;
    let sector_size = (block_size / sectors_per_block) as usize;
    let mut buf = alloc::vec![0u8; sector_size];
    let encoded = record.encode();
    buf[..EPOCH_RECORD_SIZE].copy_from_slice(&encoded);
    device.sync_io(IoOp::Write, lba, &mut buf, 1)?;
    device.barrier()?;

    Ok(AdvanceOutcome {
        new_epoch_id: next_epoch_id,
        new_block_index: next_block_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MemoryDevice;

    #[test]
    fn synced_is_ok() {
        assert_eq!(check_ring(100, 100), DriftOutcome::Ok);
    }

    #[test]
    fn small_disk_ahead_is_time_dilation() {
        assert_eq!(check_ring(150, 100), DriftOutcome::TimeDilation);
    }

    #[test]
    fn large_disk_ahead_is_media_toxic() {
        assert_eq!(check_ring(100_000, 100), DriftOutcome::MediaToxicFuture);
    }

    #[test]
    fn small_mem_ahead_is_generation_skew() {
        assert_eq!(check_ring(100, 150), DriftOutcome::GenerationSkew);
    }

    #[test]
    fn large_mem_ahead_is_media_toxic_past() {
        assert_eq!(check_ring(100, 100_000), DriftOutcome::MediaToxicPast);
    }

    #[test]
    fn wraparound_near_u64_max_is_treated_as_short_distance() {
        let disk_id = u64::MAX - 10;
        let mem_id = 5;
        assert_eq!(check_ring(disk_id, mem_id), DriftOutcome::TimeDilation);
    }

    #[test]
    fn genesis_writes_epoch_zero() {
        let dev = MemoryDevice::new(64, 16);
        write_genesis(&dev, 0, 1, 64, 1000).unwrap();
        let mut sector = alloc::vec![0u8; 64];
        dev.sync_io(IoOp::Read, Address::new(0), &mut sector, 1).unwrap();
        let raw: [u8; EPOCH_RECORD_SIZE] = sector[..EPOCH_RECORD_SIZE].try_into().unwrap();
        let record = EpochRecord::decode(&raw).unwrap();
        assert_eq!(record.epoch_id, 0);
        assert_eq!(record.timestamp_ns, 1000);
    }

    #[test]
    fn genesis_refuses_on_bad_geometry() {
        let dev = MemoryDevice::new(64, 16);
        let result = write_genesis(&dev, 0, 0, 64, 0);
        assert_eq!(result.err(), Some(EngineError::Geometry));
    }

    #[test]
    fn advance_wraps_ring_and_increments_epoch() {
        let dev = MemoryDevice::new(64, 16);
        let outcome = advance(&dev, 0, 64 * 4, 64, 1, 1 << 20, 10, 3, false, 5000).unwrap();
        assert_eq!(outcome.new_epoch_id, 11);
        assert_eq!(outcome.new_block_index, 0);
    }

    #[test]
    fn advance_refuses_when_ro() {
        let dev = MemoryDevice::new(64, 16);
        let result = advance(&dev, 0, 64 * 4, 64, 1, 1 << 20, 10, 0, true, 5000);
        assert_eq!(result.err(), Some(EngineError::AccessDenied));
    }

    #[test]
    fn advance_refuses_near_generation_ceiling() {
        let dev = MemoryDevice::new(64, 16);
        let result = advance(&dev, 0, 64 * 4, 64, 1, 1 << 20, GENERATION_CEILING + 1, 0, false, 0);
        assert_eq!(result.err(), Some(EngineError::GenerationSkew));
    }
}
