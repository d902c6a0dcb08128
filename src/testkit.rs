//! In-memory block device with fault injection, for tests only.
//!
//! Grounded on the test harness pattern of building real,
//! non-mocked in-RAM state to exercise persistence logic (tests run
//! its superblock/WAL tests directly against constructed structs rather
//! than a trait double); extended here with a real `BlockDevice` impl
//! since this engine's algorithms are specified in terms of that trait.
//! `std` is required only for the interior-mutable container (`Mutex`),
//! matching §4.14's "test harness only" scope for the `std` feature.

use crate::error::{EngineError, EngineResult};
use crate::hal::{BlockDevice, DeviceCaps, DeviceType, HwFlags, IoOp};
use crate::types::Address;
use std::sync::Mutex;
use std::vec::Vec;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fault {
    /// The next matching I/O truncates its write short of a full sector,
    /// simulating a torn write.
    TornWrite,
    /// The next matching I/O flips one bit in the target sector after it
    /// lands, simulating silent media corruption.
    BitFlip { byte_offset: usize },
    /// All I/O to this device fails until cleared.
    Offline,
}

struct State {
    data: Vec<u8>,
    sector_size: u32,
    faults: Vec<(Address, Fault)>,
    read_count: u64,
    write_count: u64,
    temperature_c: Option<i32>,
}

/// An in-memory block device. Capacity is fixed at construction;
/// `inject` schedules a one-shot fault at a given LBA.
pub struct MemoryDevice {
    state: Mutex<State>,
    sector_count: u64,
}

impl MemoryDevice {
    pub fn new(sector_size: u32, sector_count: u64) -> Self {
        MemoryDevice {
            state: Mutex::new(State {
                data: alloc::vec![0u8; sector_size as usize * sector_count as usize],
                sector_size,
                faults: Vec::new(),
                read_count: 0,
                write_count: 0,
                temperature_c: Some(35),
            }),
            sector_count,
        }
    }

    pub fn inject(&self, lba: Address, fault: Fault) {
        self.state.lock().unwrap().faults.push((lba, fault));
    }

    /// Override the fake temperature sensor reading, for thermal-gate
    /// tests. Pass `None` to simulate a device with no sensor.
    pub fn set_temperature(&self, temperature_c: Option<i32>) {
        self.state.lock().unwrap().temperature_c = temperature_c;
    }

    pub fn io_counts(&self) -> (u64, u64) {
        let s = self.state.lock().unwrap();
        (s.read_count, s.write_count)
    }

    fn take_fault(state: &mut State, lba: Address) -> Option<Fault> {
        let pos = state.faults.iter().position(|(l, _)| *l == lba)?;
        Some(state.faults.remove(pos).1)
    }
}

impl BlockDevice for MemoryDevice {
    fn caps(&self) -> DeviceCaps {
        let s = self.state.lock().unwrap();
        DeviceCaps {
            sector_size: s.sector_size,
            total_capacity_sectors: self.sector_count as u128,
            zone_size_sectors: 0,
            optimal_io_boundary: s.sector_size,
            flags: HwFlags::default(),
            device_type: DeviceType::RamDisk,
        }
    }

    fn sync_io(
        &self,
        op: IoOp,
        lba: Address,
        buf: &mut [u8],
        sector_count: u32,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(Fault::Offline) = Self::take_fault(&mut state, lba) {
            state.faults.push((lba, Fault::Offline));
            return Err(EngineError::HwIo);
        }
        let sector_size = state.sector_size as usize;
        let lba_u64 = lba.as_u64().ok_or(EngineError::Geometry)?;
        let start = lba_u64 as usize * sector_size;
        let len = sector_size * sector_count as usize;
        if start + len > state.data.len() {
            return Err(EngineError::Geometry);
        }
        match op {
            IoOp::Read => {
                state.read_count += 1;
                buf[..len].copy_from_slice(&state.data[start..start + len]);
            }
            IoOp::Write | IoOp::ZoneAppend => {
                state.write_count += 1;
                let fault = Self::take_fault(&mut state, lba);
                match fault {
                    Some(Fault::TornWrite) => {
                        let torn = len / 2;
                        state.data[start..start + torn].copy_from_slice(&buf[..torn]);
                    }
                    Some(Fault::BitFlip { byte_offset }) => {
                        state.data[start..start + len].copy_from_slice(&buf[..len]);
                        if byte_offset < len {
                            state.data[start + byte_offset] ^= 0x01;
                        }
                    }
                    _ => {
                        state.data[start..start + len].copy_from_slice(&buf[..len]);
                    }
                }
            }
            IoOp::Flush | IoOp::Discard => {}
        }
        Ok(())
    }

    fn barrier(&self) -> EngineResult<()> {
        Ok(())
    }

    fn get_time_ns(&self) -> u64 {
        let s = self.state.lock().unwrap();
        // Deterministic fake clock driven by I/O count, since real-time
        // clocks are unavailable in `no_std` and tests need reproducible
        // ordering.
        (s.read_count + s.write_count) * 1_000_000
    }

    fn get_temperature(&self) -> Option<i32> {
        self.state.lock().unwrap().temperature_c
    }

    fn prefetch(&self, _lba: Address, _sectors: u32) {}

    fn micro_sleep(&self, _us: u32) {}
}
