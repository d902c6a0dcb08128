//! Chronicle: append-only hash-chained audit ring (C2, §4.1).
//!
//! Every mutation to redundant metadata is recorded as a fixed 64-byte
//! sector entry linked to its predecessor by a CRC32C chain; a
//! `verify_integrity` pass heals "phantom heads" (a write that landed but
//! whose head pointer never advanced) and detects torn tips and rollback
//! ("time-travel").
//!
//! Grounded on `journal::wal`'s fixed-header-per-sector ring
//! (`WalBlockHeader`, sequence/CRC fields, ring position tracking),
//! re-expressed as a hash-chained ring rather than a plain sequential WAL,
//! per §3's chain-link + tail-marker entry format, and encoded through
//! `types::le` instead of a struct-cast approach.

use crate::crc32c::crc32c;
use crate::error::{EngineError, EngineResult};
use crate::hal::{BlockDevice, IoOp};
use crate::types::{le, Address};

pub const ENTRY_HEADER_SIZE: usize = 64;
const TAIL_MARKER_KEY: u64 = 0x5A5A_4348_524F_4E31; // "ZZCHRON1"
/// Bit-exact per §6: magic u64 = 0x4843524F4E49434C.
const MAGIC: u64 = 0x4843_524F_4E49_434C;

const OFF_MAGIC: usize = 0;
const OFF_SEQUENCE: usize = 8;
const OFF_TIMESTAMP: usize = 16;
const OFF_OLD_ADDR: usize = 24;
const OFF_NEW_ADDR: usize = 32;
const OFF_SELF_ADDR: usize = 40;
const OFF_PRINCIPAL_HASH: usize = 48;
const OFF_VERSION: usize = 52;
const OFF_OPCODE: usize = 53;
const OFF_PREV_SECTOR_CRC: usize = 54;
/// §6: CRC at offset 60 within the 64-byte header.
const OFF_HEADER_CRC: usize = 60;

static_assertions::const_assert!(OFF_HEADER_CRC + 4 == ENTRY_HEADER_SIZE);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum OpCode {
    Init = 0,
    Rollback = 1,
    Snapshot = 2,
    Wormhole = 3,
    Fork = 4,
}

impl OpCode {
    pub fn from_raw(v: u8) -> EngineResult<Self> {
        Ok(match v {
            0 => OpCode::Init,
            1 => OpCode::Rollback,
            2 => OpCode::Snapshot,
            3 => OpCode::Wormhole,
            4 => OpCode::Fork,
            _ => return Err(EngineError::Tampered),
        })
    }
}

/// A decoded Chronicle entry header (the first [`ENTRY_HEADER_SIZE`] bytes
/// of the sector; the remainder is unused padding except the last 8 bytes,
/// which carry the tail marker).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChronicleHeader {
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub old_addr: u64,
    pub new_addr: u64,
    pub self_addr: u64,
    pub principal_hash: u32,
    pub version: u8,
    pub op: OpCode,
    pub prev_sector_crc: u32,
}

fn write_header(buf: &mut [u8], h: &ChronicleHeader) {
    le::write_u64(buf, OFF_MAGIC, MAGIC);
    le::write_u64(buf, OFF_SEQUENCE, h.sequence);
    le::write_u64(buf, OFF_TIMESTAMP, h.timestamp_ns);
    le::write_u64(buf, OFF_OLD_ADDR, h.old_addr);
    le::write_u64(buf, OFF_NEW_ADDR, h.new_addr);
    le::write_u64(buf, OFF_SELF_ADDR, h.self_addr);
    le::write_u32(buf, OFF_PRINCIPAL_HASH, h.principal_hash);
    buf[OFF_VERSION] = h.version;
    buf[OFF_OPCODE] = h.op as u8;
    le::write_u32(buf, OFF_PREV_SECTOR_CRC, h.prev_sector_crc);
    let header_crc = crc32c(0, &buf[..OFF_HEADER_CRC]);
    le::write_u32(buf, OFF_HEADER_CRC, header_crc);
    let marker = (header_crc as u64) ^ TAIL_MARKER_KEY;
    let len = buf.len();
    le::write_u64(buf, len - 8, marker);
}

/// Validate a sector's magic, self-LBA binding, header CRC, and tail
/// marker, then return its decoded header.
fn validate_sector(sector: &[u8], self_lba: Address) -> EngineResult<ChronicleHeader> {
    if sector.len() < ENTRY_HEADER_SIZE + 8 {
        return Err(EngineError::Geometry);
    }
    if le::read_u64(sector, OFF_MAGIC) != MAGIC {
        return Err(EngineError::Tampered);
    }
    let self_addr = le::read_u64(sector, OFF_SELF_ADDR);
    if self_addr != self_lba.as_u64().ok_or(EngineError::Geometry)? {
        return Err(EngineError::Tampered);
    }
    let header_crc_stored = le::read_u32(sector, OFF_HEADER_CRC);
    let header_crc_calc = crc32c(0, &sector[..OFF_HEADER_CRC]);
    if header_crc_stored != header_crc_calc {
        return Err(EngineError::Tampered);
    }
    let tail_marker = le::read_u64(sector, sector.len() - 8);
    if tail_marker != (header_crc_stored as u64) ^ TAIL_MARKER_KEY {
        return Err(EngineError::Tampered);
    }
    Ok(ChronicleHeader {
        sequence: le::read_u64(sector, OFF_SEQUENCE),
        timestamp_ns: le::read_u64(sector, OFF_TIMESTAMP),
        old_addr: le::read_u64(sector, OFF_OLD_ADDR),
        new_addr: le::read_u64(sector, OFF_NEW_ADDR),
        self_addr,
        principal_hash: le::read_u32(sector, OFF_PRINCIPAL_HASH),
        version: sector[OFF_VERSION],
        op: OpCode::from_raw(sector[OFF_OPCODE])?,
        prev_sector_crc: le::read_u32(sector, OFF_PREV_SECTOR_CRC),
    })
}

const REVERSE_AUDIT_DEPTH_LIMIT: u64 = 65_536;

/// In-RAM ring state (the portion the Superblock persists is
/// `head`/`last_journal_seq`, mirrored here for convenience).
#[derive(Clone, Copy, Debug)]
pub struct RingState {
    pub start: u64,
    pub end: u64,
    pub head: u64,
    pub last_journal_seq: u64,
}

impl RingState {
    fn prev(&self) -> u64 {
        if self.head == self.start {
            self.end - 1
        } else {
            self.head - 1
        }
    }

    fn advance_head(&mut self) {
        self.head = if self.head + 1 == self.end {
            self.start
        } else {
            self.head + 1
        };
    }
}

pub struct AppendOutcome {
    pub new_head: u64,
    pub sequence: u64,
}

/// Append one entry. `sector_size` must be large enough for the header
/// plus the 8-byte tail marker.
pub fn append<D: BlockDevice>(
    device: &D,
    ring: &mut RingState,
    sector_size: u32,
    op: OpCode,
    old_addr: u64,
    new_addr: u64,
    principal_hash: u32,
    now_ns: u64,
) -> EngineResult<AppendOutcome> {
    if (sector_size as usize) < ENTRY_HEADER_SIZE + 8 {
        return Err(EngineError::Geometry);
    }
    if ring.head >= ring.end || ring.start >= ring.end {
        return Err(EngineError::BadSuperblock);
    }

    let prev_idx = ring.prev();
    let mut prev_sector = alloc::vec![0u8; sector_size as usize];
    device.sync_io(IoOp::Read, Address::new(prev_idx), &mut prev_sector, 1)?;

    let at_genesis = ring.last_journal_seq == 0 && ring.head == ring.start;
    let prev_seq;
    let link;
    if at_genesis {
        prev_seq = 0;
        link = 0;
    } else {
        let prev_header = validate_sector(&prev_sector, Address::new(prev_idx))
            .map_err(|_| EngineError::Tampered)?;
        if prev_header.sequence == u64::MAX {
            return Err(EngineError::Geometry);
        }
        if prev_header.sequence == 0 {
            return Err(EngineError::DataRot);
        }
        prev_seq = prev_header.sequence;
        link = crc32c(0, &prev_sector);
    }

    let next_seq = prev_seq + 1;
    let mut sector = alloc::vec![0u8; sector_size as usize];
    let header = ChronicleHeader {
        sequence: next_seq,
        timestamp_ns: now_ns,
        old_addr,
        new_addr,
        self_addr: ring.head,
        principal_hash,
        version: 1,
        op,
        prev_sector_crc: link,
    };
    write_header(&mut sector, &header);

    device.sync_io(IoOp::Write, Address::new(ring.head), &mut sector, 1)?;
    device.barrier()?;

    ring.advance_head();
    ring.last_journal_seq = next_seq;

    Ok(AppendOutcome {
        new_head: ring.head,
        sequence: next_seq,
    })
}

pub enum VerifyReport {
    Empty,
    Ok { tip_sequence: u64, walked: u64 },
}

/// `verify_integrity` pass 1: heal phantom heads in place, advancing `ring`
/// for each entry found sitting one past the recorded head. Returns the
/// number of heals applied.
pub fn heal_phantom_heads<D: BlockDevice>(
    device: &D,
    ring: &mut RingState,
    sector_size: u32,
) -> EngineResult<u32> {
    let mut heals = 0u32;
    loop {
        let mut head_sector = alloc::vec![0u8; sector_size as usize];
        if device
            .sync_io(IoOp::Read, Address::new(ring.head), &mut head_sector, 1)
            .is_err()
        {
            break;
        }
        let Ok(phantom) = validate_sector(&head_sector, Address::new(ring.head)) else {
            break;
        };
        let prev_idx = ring.prev();
        let mut prev_sector = alloc::vec![0u8; sector_size as usize];
        if device
            .sync_io(IoOp::Read, Address::new(prev_idx), &mut prev_sector, 1)
            .is_err()
        {
            break;
        }
        let Ok(prev) = validate_sector(&prev_sector, Address::new(prev_idx)) else {
            break;
        };
        if phantom.sequence != prev.sequence + 1 {
            break;
        }
        if phantom.prev_sector_crc != crc32c(0, &prev_sector) {
            break;
        }
        ring.advance_head();
        ring.last_journal_seq = phantom.sequence;
        heals += 1;
    }
    Ok(heals)
}

/// `verify_integrity` pass 2: bounded reverse audit from the current tip.
pub fn reverse_audit<D: BlockDevice>(
    device: &D,
    ring: &RingState,
    sector_size: u32,
) -> EngineResult<VerifyReport> {
    if ring.head == ring.start && ring.last_journal_seq == 0 {
        return Ok(VerifyReport::Empty);
    }

    let tip_idx = ring.prev();
    let mut tip_sector = alloc::vec![0u8; sector_size as usize];
    let tip_read_ok = device
        .sync_io(IoOp::Read, Address::new(tip_idx), &mut tip_sector, 1)
        .is_ok();
    let tip = if tip_read_ok {
        validate_sector(&tip_sector, Address::new(tip_idx)).ok()
    } else {
        None
    };

    let Some(tip_header) = tip else {
        if ring.head == ring.start {
            return Ok(VerifyReport::Empty);
        }
        return Err(EngineError::Tampered);
    };

    if ring.last_journal_seq > 0 && tip_header.sequence < ring.last_journal_seq {
        return Err(EngineError::Tampered);
    }

    let mut walked = 0u64;
    let mut cur_idx = tip_idx;
    let mut cur_header = tip_header;
    loop {
        if cur_header.sequence == 1 {
            break;
        }
        if walked >= REVERSE_AUDIT_DEPTH_LIMIT {
            break;
        }
        let prev_idx = if cur_idx == ring.start {
            ring.end - 1
        } else {
            cur_idx - 1
        };
        let mut prev_sector = alloc::vec![0u8; sector_size as usize];
        if device
            .sync_io(IoOp::Read, Address::new(prev_idx), &mut prev_sector, 1)
            .is_err()
        {
            return Err(EngineError::HwIo);
        }
        let Ok(prev_header) = validate_sector(&prev_sector, Address::new(prev_idx)) else {
            break;
        };
        if cur_header.prev_sector_crc != crc32c(0, &prev_sector) {
            return Err(EngineError::Tampered);
        }
        if cur_header.sequence != prev_header.sequence + 1 {
            return Err(EngineError::Tampered);
        }
        cur_idx = prev_idx;
        cur_header = prev_header;
        walked += 1;
    }
    let _ = cur_idx;

    Ok(VerifyReport::Ok {
        tip_sequence: tip_header.sequence,
        walked,
    })
}
