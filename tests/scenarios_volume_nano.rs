//! Nano Store round trip and write-path refusal through the public Volume
//! handle.

#![cfg(feature = "std")]

use cortex_engine::anchor::{Anchor, DataClass};
use cortex_engine::hal::{BlockDevice, CompressionAlgo, Compressor, TrajectoryHelper};
use cortex_engine::mount::MountIntent;
use cortex_engine::superblock::{
    cardinal_byte_offsets, AddressWidth, FormatProfile, RegionLayout, StateFlags, Superblock,
    SUPERBLOCK_SIZE,
};
use cortex_engine::testkit::MemoryDevice;
use cortex_engine::types::{Address, Id128};
use cortex_engine::{EngineError, Volume};

struct IdentityCompressor;
impl Compressor for IdentityCompressor {
    fn decompress(
        &self,
        _algo: CompressionAlgo,
        input: &[u8],
        output: &mut [u8],
    ) -> cortex_engine::EngineResult<usize> {
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
    ) -> cortex_engine::EngineResult<Address> {
        Ok(Address::new(
            gravity_center + self.gravity_center + block_index + orbit as u64 * 1000,
        ))
    }
}

fn sample_sb(sector_size: u32, capacity_sectors: u128) -> Superblock {
    let mut state = StateFlags::default();
    state.set(StateFlags::CLEAN);
    Superblock {
        version: 1,
        profile: FormatProfile::Generic,
        hw_flags: Default::default(),
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
        layout: RegionLayout {
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

fn mounted_volume(
    intent: MountIntent,
) -> Volume<MemoryDevice, cortex_engine::crc32c::SoftwareCrc32c, IdentityCompressor, LinearTrajectory>
{
    let sector_size = 512u32;
    let dev = MemoryDevice::new(sector_size, 20_000);
    let sb = sample_sb(sector_size, 20_000);
    let capacity_bytes = sb.total_capacity_sectors * sector_size as u128;
    let offsets = cardinal_byte_offsets(capacity_bytes, sb.block_size as u64, SUPERBLOCK_SIZE as u64);
    let encoded = sb.encode();
    for off in offsets.into_iter().flatten() {
        let lba = Address::new128(off / sector_size as u128);
        let mut buf = vec![0u8; sector_size as usize];
        buf[..SUPERBLOCK_SIZE].copy_from_slice(&encoded);
        dev.sync_io(cortex_engine::hal::IoOp::Write, lba, &mut buf, 1)
            .unwrap();
    }
    cortex_engine::root_anchor::write_genesis(
        &dev,
        true,
        sb.layout.cortex_start,
        1,
        sector_size,
        sector_size,
        1,
        0,
    )
    .unwrap();

    Volume::mount(
        dev,
        cortex_engine::crc32c::SoftwareCrc32c,
        IdentityCompressor,
        LinearTrajectory { gravity_center: 2 },
        intent,
    )
    .unwrap()
}

#[test]
fn nano_write_then_read_round_trips_bit_identical() {
    let volume = mounted_volume(MountIntent::default());
    let mut anchor = Anchor::empty();
    anchor.seed_id = Id128(99);
    anchor.data_class.set(DataClass::VALID);

    volume
        .write_nano(&mut anchor, Id128(99), b"small payload", 1)
        .unwrap();

    let mut out = [0u8; 13];
    let n = volume.read_nano(&anchor, &mut out).unwrap();
    assert_eq!(n, 13);
    assert_eq!(&out, b"small payload");

    // A second read must be bit-identical to the first.
    let mut out2 = [0u8; 13];
    volume.read_nano(&anchor, &mut out2).unwrap();
    assert_eq!(out, out2);
}

#[test]
fn write_nano_refused_on_read_only_mount() {
    let volume = mounted_volume(MountIntent {
        wormhole: false,
        read_only: true,
    });
    let mut anchor = Anchor::empty();
    anchor.seed_id = Id128(5);

    let result = volume.write_nano(&mut anchor, Id128(5), b"x", 1);
    assert_eq!(result.err(), Some(EngineError::VolumeLocked));
}
