//! Root Anchor Manager: genesis write + verify/heal (C5, §4.4).
//!
//! The root anchor is the one well-known record at the first block of the
//! Cortex table: `write_genesis` creates it at format time, and
//! `verify_and_heal` is invoked on every mount to confirm it is present
//! and semantically sane, rewriting it if corrupt and the mount is
//! read-write.
//!
//! Grounded on `disk::superblock`'s genesis-construction style
//! (a `create`/`new` constructor filling in well-known defaults, checksum
//! computed last) adapted to the 128-byte [`Anchor`] record instead of the
//! superblock.

use crate::anchor::{Anchor, DataClass, Permissions, ANCHOR_SIZE};
use crate::error::{EngineError, EngineResult};
use crate::hal::{BlockDevice, IoOp};
use crate::types::{Address, Id128};

pub const ROOT_NAME: &[u8] = b"ROOT";

/// Build the root anchor record, per §4.4's field recipe.
fn build_root_anchor(generation_ts_ns: u64, compat_permission_bits: u32) -> Anchor {
    let mut a = Anchor::empty();
    a.seed_id = Id128::ALL_ONES;
    a.public_id = Id128::ALL_ONES;
    a.data_class.set(DataClass::STATIC | DataClass::VALID);
    let base_perms = Permissions::READ
        | Permissions::WRITE
        | Permissions::EXEC
        | Permissions::IMMUTABLE
        | Permissions::SOVEREIGN;
    // Compat-flag injections are masked to the set of permission bits this
    // format understands; anything outside that mask is simply ignored
    // rather than rejected.
    let injected = compat_permission_bits & base_perms;
    a.permissions = Permissions(base_perms | injected);
    a.inline_buffer[..ROOT_NAME.len()].copy_from_slice(ROOT_NAME);
    a.orbit_vector[0] = 1;
    a.mod_clock = generation_ts_ns;
    a.create_clock = (generation_ts_ns / 1_000_000_000) as u32;
    a
}

/// Requires `metadata-zeroed` to be set by the caller, `cortex_start_lba`
/// a multiple of `sectors_per_block`, and `block_size >= sector_size`.
pub fn write_genesis<D: BlockDevice>(
    device: &D,
    metadata_zeroed: bool,
    cortex_start_lba: u64,
    sectors_per_block: u64,
    block_size: u32,
    sector_size: u32,
    generation_ts_ns: u64,
    compat_permission_bits: u32,
) -> EngineResult<()> {
    if !metadata_zeroed {
        return Err(EngineError::InvalidArgument);
    }
    if sectors_per_block == 0 || cortex_start_lba % sectors_per_block != 0 {
        return Err(EngineError::Geometry);
    }
    if block_size < sector_size {
        return Err(EngineError::Geometry);
    }

    let anchor = build_root_anchor(generation_ts_ns, compat_permission_bits);
    let encoded = anchor.encode();
    let mut sector = alloc::vec![0u8; sector_size as usize];
    sector[..ANCHOR_SIZE].copy_from_slice(&encoded);
    device.sync_io(IoOp::Write, Address::new(cortex_start_lba), &mut sector, 1)?;
    device.barrier()
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HealOutcome {
    Valid,
    NotFound,
    Healed,
}

/// Verify the root anchor and, on read-write mounts, heal a corrupt one.
pub fn verify_and_heal<D: BlockDevice>(
    device: &D,
    cortex_start_lba: u64,
    sector_size: u32,
    ro: bool,
    generation_ts_ns: u64,
) -> EngineResult<HealOutcome> {
    let mut sector = alloc::vec![0u8; sector_size as usize];
    device.sync_io(IoOp::Read, Address::new(cortex_start_lba), &mut sector, 1)?;
    let raw: [u8; ANCHOR_SIZE] = sector[..ANCHOR_SIZE]
        .try_into()
        .map_err(|_| EngineError::Geometry)?;

    match Anchor::decode(&raw) {
        Ok(a) => {
            let semantics_ok = a.seed_id == Id128::ALL_ONES
                && a.data_class.contains(DataClass::VALID)
                && a.data_class.contains(DataClass::STATIC);
            if semantics_ok {
                Ok(HealOutcome::Valid)
            } else {
                // CRC is fine but the record isn't the root we expect:
                // an explicit tombstone or config mismatch, not damage.
                Err(EngineError::NotFound)
            }
        }
        Err(EngineError::DataRot) => {
            if ro {
                return Err(EngineError::NotFound);
            }
            let anchor = build_root_anchor(generation_ts_ns, 0);
            let encoded = anchor.encode();
            let mut out = alloc::vec![0u8; sector_size as usize];
            out[..ANCHOR_SIZE].copy_from_slice(&encoded);
            device.sync_io(IoOp::Write, Address::new(cortex_start_lba), &mut out, 1)?;
            device.barrier()?;
            let mut verify = alloc::vec![0u8; sector_size as usize];
            device.sync_io(IoOp::Read, Address::new(cortex_start_lba), &mut verify, 1)?;
            if verify[..ANCHOR_SIZE] != out[..ANCHOR_SIZE] {
                return Err(EngineError::HwIo);
            }
            Ok(HealOutcome::Healed)
        }
        Err(e) => Err(e),
    }
}
