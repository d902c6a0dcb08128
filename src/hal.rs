//! External collaborator contracts (§6).
//!
//! Everything in this module is a trait: the block-device HAL, CRC32C,
//! compression, the namespace resolver, the bitmap bit-test primitive, and
//! the trajectory LBA helper are all out of scope per §1 — the engine only
//! specifies how it calls them. `crc32c` ships one reference implementation
//! of [`Crc32cProvider`] so the crate is runnable without a host-supplied
//! one; [`testkit`](crate::testkit) ships reference implementations of the
//! rest, for tests only.
//!
//! Grounded on `disk::device::{BlockRead, BlockWrite,
//! BlockDeviceInfo, BlockDiscard}` trait split — merged here into the
//! single `BlockDevice` contract `spec.md` §6 describes, since the engine
//! never needs read-only or write-only device handles on their own.

use crate::error::EngineResult;
use crate::types::Address;

/// One I/O operation kind a [`BlockDevice`] must serve.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoOp {
    Read,
    Write,
    Flush,
    Discard,
    ZoneAppend,
}

/// Hardware capability flags reported by [`BlockDevice::caps`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HwFlags {
    pub rotational: bool,
    pub zns_native: bool,
    pub strict_flush: bool,
    pub nvm_byte_addressable: bool,
    pub gpu_direct: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceType {
    Hdd,
    Ssd,
    Nvme,
    Zns,
    RamDisk,
    Tape,
    Usb,
}

/// Static capabilities of a block device, reported once at probe time.
#[derive(Clone, Copy, Debug)]
pub struct DeviceCaps {
    pub sector_size: u32,
    pub total_capacity_sectors: u128,
    pub zone_size_sectors: u64,
    pub optimal_io_boundary: u32,
    pub flags: HwFlags,
    pub device_type: DeviceType,
}

/// The block-device HAL. Every call that may suspend (I/O, barrier, sleep,
/// allocation) lives behind this trait; everything else in the engine is
/// non-suspending (spec §5).
pub trait BlockDevice {
    fn caps(&self) -> DeviceCaps;

    /// Perform `op` at `lba` against `buf`, covering `sector_count`
    /// sectors. For `Read`/`Write` the buffer length must be
    /// `sector_count * sector_size`.
    fn sync_io(
        &self,
        op: IoOp,
        lba: Address,
        buf: &mut [u8],
        sector_count: u32,
    ) -> EngineResult<()>;

    /// Durability fence: all writes issued before this call are guaranteed
    /// persisted once it returns `Ok`.
    fn barrier(&self) -> EngineResult<()>;

    fn get_time_ns(&self) -> u64;

    /// Device temperature in degrees Celsius, if the device exposes a
    /// sensor.
    fn get_temperature(&self) -> Option<i32>;

    fn prefetch(&self, lba: Address, sectors: u32);

    fn micro_sleep(&self, us: u32);
}

/// CRC32C (Castagnoli) provider contract.
pub trait Crc32cProvider {
    fn crc32c(&self, seed: u32, data: &[u8]) -> u32;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompressionAlgo {
    None = 0,
    Tcc = 1,
}

impl CompressionAlgo {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressionAlgo::None),
            1 => Some(CompressionAlgo::Tcc),
            _ => None,
        }
    }
}

/// Compression codec contract.
pub trait Compressor {
    fn decompress(
        &self,
        algo: CompressionAlgo,
        input: &[u8],
        output: &mut [u8],
    ) -> EngineResult<usize>;
}

/// Namespace resolver contract (path -> anchor, tag -> shard set).
pub trait NamespaceResolver {
    fn resolve(&self, path: &str) -> EngineResult<Address>;
    /// Gather up to `out.len()` shard anchor locations tagged `tag`.
    /// Returns the number found (which may exceed `out.len()`, signalling
    /// overflow to the caller).
    fn gather_tensor_shards(&self, tag: &str, out: &mut [Address]) -> EngineResult<usize>;
}

/// Allocation bitmap bit-test/set/clear primitive (external per §1).
pub trait BitmapOp {
    fn test(&self, block: u64) -> EngineResult<bool>;
    fn set(&mut self, block: u64) -> EngineResult<()>;
    fn clear(&mut self, block: u64) -> EngineResult<()>;
    fn force_clear(&mut self, block: u64) -> EngineResult<()>;
}

/// Trajectory LBA helper contract: maps (object identity, block index,
/// orbit) to a physical LBA.
pub trait TrajectoryHelper {
    fn calc_trajectory_lba(
        &self,
        gravity_center: u64,
        orbit_vector: u64,
        block_index: u64,
        fractal_scale: u16,
        orbit: u8,
    ) -> EngineResult<Address>;
}
