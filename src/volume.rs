//! Volume: the owning handle a caller mounts and keeps open (§3 Ownership,
//! §5 Concurrency).
//!
//! Everything else in this crate is a free function operating on borrowed
//! state; `Volume` is where that state actually lives between calls. It
//! owns the device and its collaborators, the mounted superblock and
//! on-disk-state snapshots (`CortexTable`, `OccupancyBitmap`, `QMaskTable`),
//! the in-RAM caches (C10 Tensor Stream View's shard lists pass straight
//! through, but the L2 summary and topology map are cached here), and the
//! atomic health counters every read/write/heal path updates.
//!
//! Grounded on the per-resource spinlock-table pattern
//! (`spin::Mutex` guarding a small bit of shared state, as used in
//! [`crate::router`] and the lazy GF(2^8) table init in [`crate::gf256`]):
//! the L2 lock here follows the same shape, guarding the two caches rather
//! than a fixed device array.

use crate::anchor::{Anchor, CortexTable, Permissions};
use crate::bitmap::OccupancyBitmap;
use crate::cache::ArcCache;
use crate::error::{EngineError, EngineResult, Outcome};
use crate::hal::{
    BlockDevice, Compressor, Crc32cProvider, DeviceCaps, NamespaceResolver, TrajectoryHelper,
};
use crate::medic::MedicCounters;
use crate::mount::{self, MountIntent, MountOutcome};
use crate::nano;
use crate::qmask::QMaskTable;
use crate::read::{self, ReadContext};
use crate::superblock::Superblock;
use crate::tensor::{self, TensorContext};
use crate::types::Id128;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

/// Default L2 summary / topology cache sizing. A mounted volume's working
/// set is dominated by recently touched Cortex slots, not the full table,
/// so a fixed small cache is sufficient rather than one sized to capacity.
const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Atomic counters every repair/read/write path updates in place (§5: "all
/// counters in volume.health are atomic; no lock is taken to update them").
pub struct Health {
    pub heal_count: AtomicU64,
    pub toxic_blocks: AtomicU64,
    pub barrier_failures: AtomicU64,
    pub crc_failures: AtomicU64,
    pub trajectory_collapse_counter: AtomicU64,
    pub ref_count: AtomicU32,
    pub taint_counter: AtomicU32,
    pub degraded: AtomicBool,
    /// Monotonic timestamp of the last emitted critical log, for the 5s
    /// per-volume rate limit (§4.1).
    last_critical_log_ns: AtomicU64,
}

/// Minimum spacing between critical-log emissions for one volume (§4.1).
const CRITICAL_LOG_INTERVAL_NS: u64 = 5_000_000_000;

impl Health {
    fn new() -> Self {
        Health {
            heal_count: AtomicU64::new(0),
            toxic_blocks: AtomicU64::new(0),
            barrier_failures: AtomicU64::new(0),
            crc_failures: AtomicU64::new(0),
            trajectory_collapse_counter: AtomicU64::new(0),
            ref_count: AtomicU32::new(0),
            taint_counter: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            last_critical_log_ns: AtomicU64::new(0),
        }
    }

    fn seed_from(&self, outcome: &MountOutcome) {
        self.taint_counter.store(outcome.taint, Ordering::Release);
        self.heal_count
            .fetch_add(outcome.repaired_blocks as u64, Ordering::AcqRel);
        self.toxic_blocks
            .fetch_add(outcome.filtered_phantoms as u64, Ordering::AcqRel);
        self.degraded.store(outcome.panic, Ordering::Release);
    }

    /// Emit `message` via `log::error!`, but at most once every 5 seconds
    /// of device time for this volume (§4.1's rate-limited critical log,
    /// generalized here from the Chronicle to every critical path that
    /// shares this volume's counters).
    fn log_critical(&self, now_ns: u64, message: core::fmt::Arguments<'_>) {
        let last = self.last_critical_log_ns.load(Ordering::Acquire);
        if now_ns.saturating_sub(last) < CRITICAL_LOG_INTERVAL_NS {
            return;
        }
        if self
            .last_critical_log_ns
            .compare_exchange(last, now_ns, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::error!("{}", message);
        }
    }
}

/// In-RAM caches the volume owns and frees on unmount (§3 Ownership):
/// summarized Cortex lookups and a block-to-orbit topology hint, both
/// guarded by the volume's L2 lock.
struct Caches {
    l2_summary: ArcCache<u64>,
    topology: ArcCache<u64>,
}

impl Caches {
    fn new() -> Self {
        Caches {
            l2_summary: ArcCache::new(DEFAULT_CACHE_CAPACITY),
            topology: ArcCache::new(DEFAULT_CACHE_CAPACITY),
        }
    }
}

/// A mounted volume: device plus collaborators plus live on-disk-state
/// snapshots. Parameterized exactly like [`ReadContext`] so the two stay
/// interchangeable.
pub struct Volume<D, C, X, T> {
    device: D,
    crc: C,
    compressor: X,
    trajectory: T,
    caps: DeviceCaps,
    superblock: Superblock,
    read_only: bool,
    panic: bool,
    cortex: CortexTable,
    bitmap: OccupancyBitmap,
    qmask: QMaskTable,
    caches: Mutex<Caches>,
    pub health: Health,
}

impl<D, C, X, T> Volume<D, C, X, T>
where
    D: BlockDevice,
    C: Crc32cProvider,
    X: Compressor,
    T: TrajectoryHelper,
{
    /// Run the mount state machine (C9, §4.8) and take ownership of the
    /// device and its collaborators on success.
    pub fn mount(
        device: D,
        crc: C,
        compressor: X,
        trajectory: T,
        intent: MountIntent,
    ) -> EngineResult<Self> {
        let outcome = mount::mount(&device, &crc, &trajectory, intent)?;
        let caps = device.caps();
        let health = Health::new();
        health.seed_from(&outcome);
        Ok(Volume {
            device,
            crc,
            compressor,
            trajectory,
            caps,
            superblock: outcome.superblock,
            read_only: outcome.read_only,
            panic: outcome.panic,
            cortex: outcome.cortex,
            bitmap: outcome.bitmap,
            qmask: outcome.qmask,
            caches: Mutex::new(Caches::new()),
            health,
        })
    }

    /// Run the unmount sequence (refusing while any handle is still
    /// outstanding) and hand the device back to the caller.
    pub fn unmount(self) -> EngineResult<D> {
        let ref_count = self.health.ref_count.load(Ordering::Acquire);
        mount::unmount(
            &self.device,
            &self.superblock,
            self.caps.sector_size,
            self.caps.flags.zns_native,
            ref_count,
        )?;
        Ok(self.device)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_panicked(&self) -> bool {
        self.panic
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn cortex(&self) -> &CortexTable {
        &self.cortex
    }

    pub fn cortex_mut(&mut self) -> &mut CortexTable {
        &mut self.cortex
    }

    fn read_context(&self) -> ReadContext<'_, D, C, X, T> {
        ReadContext {
            device: &self.device,
            crc: &self.crc,
            compressor: &self.compressor,
            trajectory: &self.trajectory,
            bitmap: &self.bitmap,
            bitmap_load_failed: false,
            profile: self.superblock.profile,
            rotational: self.caps.flags.rotational,
            nvm: self.caps.flags.nvm_byte_addressable,
            rw: !self.read_only,
            taint: self.health.taint_counter.load(Ordering::Acquire),
        }
    }

    /// Ballistic Read (C8, §4.7) against a live anchor, wired to this
    /// volume's own device/collaborators and health counters.
    pub fn read_block(
        &self,
        anchor: &Anchor,
        block_index: u64,
        out: &mut [u8],
        session_permissions: Permissions,
    ) -> EngineResult<Outcome<()>> {
        let ctx = self.read_context();
        let counters = MedicCounters {
            heal_count: &self.health.heal_count,
            toxic_blocks: &self.health.toxic_blocks,
            degraded: &self.health.degraded,
        };
        let result = read::read_block_atomic(
            &ctx,
            anchor,
            block_index,
            out,
            session_permissions,
            Some((&self.qmask, &counters)),
        );
        if let Err(e) = &result {
            if matches!(e, EngineError::HwIo | EngineError::DataRot) {
                self.health.crc_failures.fetch_add(1, Ordering::AcqRel);
                let now = self.device.get_time_ns();
                self.health
                    .log_critical(now, format_args!("block {block_index} read failed: {e:?}"));
            }
        }
        result
    }

    /// Write a small object through the Nano Store (C11, §4.10) and fold
    /// the outcome back into `anchor`.
    pub fn write_nano(
        &self,
        anchor: &mut Anchor,
        owner_id: Id128,
        payload: &[u8],
        sequence: u64,
    ) -> EngineResult<()> {
        if self.read_only {
            return Err(EngineError::VolumeLocked);
        }
        let layout = self.superblock.layout;
        let outcome = nano::write(
            &self.device,
            layout.cortex_start,
            self.cortex.capacity() as u64,
            self.caps.sector_size,
            owner_id,
            payload,
            sequence,
            self.superblock.uuid,
            self.superblock.generation,
        )?;
        nano::apply_write_to_anchor(
            anchor,
            &outcome,
            payload.len(),
            sequence,
            self.device.get_time_ns(),
        );
        Ok(())
    }

    pub fn read_nano(&self, anchor: &Anchor, out: &mut [u8]) -> EngineResult<usize> {
        let layout = self.superblock.layout;
        nano::read(
            &self.device,
            layout.cortex_start,
            self.cortex.capacity() as u64,
            self.caps.sector_size,
            anchor,
            self.superblock.uuid,
            self.superblock.generation,
            out,
        )
    }

    /// Open a Tensor Stream View (C10, §4.9) over the shards `resolver`
    /// reports for `tag`. Bumps the volume's own ref-count so `unmount`
    /// refuses while the view is outstanding.
    pub fn open_tensor<'a, R: NamespaceResolver>(
        &'a self,
        resolver: &R,
        tag: &str,
    ) -> EngineResult<TensorContext<'a>> {
        tensor::open(
            resolver,
            &self.device,
            tag,
            self.caps.sector_size,
            &self.health.ref_count,
        )
    }

    /// Look up a cached L2 summary value (arbitrary caller-defined
    /// u64-keyed payload, e.g. a folded seed-id), or fall back to
    /// `compute` and populate the cache on miss.
    pub fn l2_summary_or_insert(&self, key: u64, compute: impl FnOnce() -> u64) -> u64 {
        let mut caches = self.caches.lock();
        if let Some(v) = caches.l2_summary.get(key) {
            return *v;
        }
        let value = compute();
        caches.l2_summary.insert(key, value);
        value
    }

    /// Look up a cached topology hint (e.g. the last-known-good orbit for
    /// a block), or fall back to `compute` and populate the cache on miss.
    pub fn topology_hint_or_insert(&self, key: u64, compute: impl FnOnce() -> u64) -> u64 {
        let mut caches = self.caches.lock();
        if let Some(v) = caches.topology.get(key) {
            return *v;
        }
        let value = compute();
        caches.topology.insert(key, value);
        value
    }

    /// Drop any cached summary/topology entries for `key`, e.g. after a
    /// tombstone or a repair that changes the winning orbit.
    pub fn invalidate_cache(&self, key: u64) {
        let mut caches = self.caches.lock();
        caches.l2_summary.remove(key);
        caches.topology.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc32c::SoftwareCrc32c;
    use crate::testkit::MemoryDevice;
    use crate::types::Address;

    struct IdentityCompressor;
    impl Compressor for IdentityCompressor {
        fn decompress(
            &self,
            _algo: crate::hal::CompressionAlgo,
            input: &[u8],
            output: &mut [u8],
        ) -> EngineResult<usize> {
            let n = input.len().min(output.len());
            output[..n].copy_from_slice(&input[..n]);
            Ok(n)
        }
    }

    struct LinearTrajectory {
        gravity_center: u64,
    }
    impl TrajectoryHelper for LinearTrajectory {
        fn calc_trajectory_lba(
            &self,
            gravity_center: u64,
            _orbit_vector: u64,
            block_index: u64,
            _fractal_scale: u16,
            orbit: u8,
        ) -> EngineResult<Address> {
            Ok(Address::new(
                gravity_center + self.gravity_center + block_index + orbit as u64 * 1000,
            ))
        }
    }

    fn sample_sb(sector_size: u32, capacity_sectors: u128) -> Superblock {
        use crate::profile::FormatProfile;
        use crate::types::AddressWidth;

        let mut state = crate::superblock::StateFlags::default();
        state.set(crate::superblock::StateFlags::CLEAN);
        Superblock {
            version: 1,
            profile: FormatProfile::Generic,
            hw_flags: crate::hal::HwFlags::default(),
            address_width: AddressWidth::Narrow64,
            block_size: sector_size,
            uuid: Id128(7),
            total_capacity_sectors: capacity_sectors,
            generation: 1,
            last_mount_time_ns: 1,
            state_flags: state,
            features_incompat: 0,
            features_ro_compat: 0,
            features_compat: 0,
            layout: crate::superblock::RegionLayout {
                epoch_start: 4,
                cortex_start: 8,
                bitmap_start: 16,
                qmask_start: 24,
                flux_start: 32,
                horizon_start: 40,
                stream_start: 48,
                journal_start: 56,
                journal_ptr: 56,
                epoch_ring_block_idx: 0,
            },
        }
    }

    fn seed_superblock(dev: &MemoryDevice, sb: &Superblock, sector_size: u32) {
        use crate::hal::IoOp;
        use crate::superblock::SUPERBLOCK_SIZE;

        let capacity_bytes = sb.total_capacity_sectors * sector_size as u128;
        let offsets = crate::superblock::cardinal_byte_offsets(
            capacity_bytes,
            sb.block_size as u64,
            SUPERBLOCK_SIZE as u64,
        );
        let encoded = sb.encode();
        for off in offsets.into_iter().flatten() {
            let lba = Address::new128(off / sector_size as u128);
            let mut buf = alloc::vec![0u8; sector_size as usize];
            buf[..SUPERBLOCK_SIZE].copy_from_slice(&encoded);
            dev.sync_io(IoOp::Write, lba, &mut buf, 1).unwrap();
        }
    }

    fn mounted_volume(
        dev: MemoryDevice,
        sb: &Superblock,
        sector_size: u32,
    ) -> Volume<MemoryDevice, SoftwareCrc32c, IdentityCompressor, LinearTrajectory> {
        seed_superblock(&dev, sb, sector_size);
        crate::root_anchor::write_genesis(&dev, true, sb.layout.cortex_start, 1, sector_size, sector_size, 1, 0)
            .unwrap();
        Volume::mount(
            dev,
            SoftwareCrc32c,
            IdentityCompressor,
            LinearTrajectory { gravity_center: 2 },
            MountIntent::default(),
        )
        .expect("mount succeeds against a freshly seeded device")
    }

    #[test]
    fn mount_then_unmount_round_trips() {
        let sector_size = 512u32;
        let dev = MemoryDevice::new(sector_size, 20_000);
        let sb = sample_sb(sector_size, 20_000);
        let volume = mounted_volume(dev, &sb, sector_size);
        assert!(!volume.is_read_only());
        assert_eq!(volume.health.ref_count.load(Ordering::Acquire), 0);
        volume.unmount().expect("clean unmount with zero ref-count");
    }

    #[test]
    fn unmount_refuses_with_outstanding_refs() {
        let sector_size = 512u32;
        let dev = MemoryDevice::new(sector_size, 20_000);
        let sb = sample_sb(sector_size, 20_000);
        let volume = mounted_volume(dev, &sb, sector_size);
        volume.health.ref_count.fetch_add(1, Ordering::AcqRel);
        assert!(matches!(volume.unmount(), Err(EngineError::Busy)));
    }

    #[test]
    fn cache_helpers_populate_and_invalidate() {
        let sector_size = 512u32;
        let dev = MemoryDevice::new(sector_size, 20_000);
        let sb = sample_sb(sector_size, 20_000);
        let volume = mounted_volume(dev, &sb, sector_size);
        let mut calls = 0u32;
        let v1 = volume.l2_summary_or_insert(7, || {
            calls += 1;
            42
        });
        assert_eq!(v1, 42);
        let v2 = volume.l2_summary_or_insert(7, || {
            calls += 1;
            99
        });
        assert_eq!(v2, 42);
        assert_eq!(calls, 1);
        volume.invalidate_cache(7);
        let v3 = volume.l2_summary_or_insert(7, || 7);
        assert_eq!(v3, 7);
    }
}
