//! Format profiles (§4.13, ambient configuration surface).
//!
//! The engine is a library with no environment or file-based configuration
//! of its own; the one configuration knob `spec.md` names is the format
//! profile selected at format time and stored in the superblock, which
//! tunes retry counts, backoff curves, and structure depths for the target
//! media. Grounded on the per-feature tuning constants scattered
//! across `disk/superblock.rs`; collected here into one table per the
//! "generic/gaming/AI/archive/pico/system/USB/hyper-cloud" profile list.

/// Selects the tuning constants in [`ProfileTuning`] for a volume.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FormatProfile {
    Generic = 0,
    Gaming = 1,
    Ai = 2,
    Archive = 3,
    Pico = 4,
    System = 5,
    Usb = 6,
    HyperCloud = 7,
}

impl FormatProfile {
    pub fn from_raw(v: u8) -> Option<Self> {
        use FormatProfile::*;
        Some(match v {
            0 => Generic,
            1 => Gaming,
            2 => Ai,
            3 => Archive,
            4 => Pico,
            5 => System,
            6 => Usb,
            7 => HyperCloud,
            _ => return None,
        })
    }

    pub const fn tuning(self) -> ProfileTuning {
        use FormatProfile::*;
        match self {
            Generic => ProfileTuning {
                ballistic_candidates: 3,
                medic_retry_max: 4,
                backoff_base_us: 200,
                cortex_probe_depth: 8,
                chronicle_sector_count: 256,
                nano_triangular_max: 16,
            },
            Gaming => ProfileTuning {
                ballistic_candidates: 2,
                medic_retry_max: 2,
                backoff_base_us: 50,
                cortex_probe_depth: 6,
                chronicle_sector_count: 128,
                nano_triangular_max: 12,
            },
            Ai => ProfileTuning {
                ballistic_candidates: 5,
                medic_retry_max: 6,
                backoff_base_us: 300,
                cortex_probe_depth: 16,
                chronicle_sector_count: 512,
                nano_triangular_max: 24,
            },
            Archive => ProfileTuning {
                ballistic_candidates: 7,
                medic_retry_max: 8,
                backoff_base_us: 1000,
                cortex_probe_depth: 24,
                chronicle_sector_count: 1024,
                nano_triangular_max: 32,
            },
            Pico => ProfileTuning {
                ballistic_candidates: 1,
                medic_retry_max: 1,
                backoff_base_us: 20,
                cortex_probe_depth: 4,
                chronicle_sector_count: 32,
                nano_triangular_max: 8,
            },
            System => ProfileTuning {
                ballistic_candidates: 4,
                medic_retry_max: 5,
                backoff_base_us: 150,
                cortex_probe_depth: 12,
                chronicle_sector_count: 384,
                nano_triangular_max: 20,
            },
            Usb => ProfileTuning {
                ballistic_candidates: 3,
                medic_retry_max: 3,
                backoff_base_us: 500,
                cortex_probe_depth: 8,
                chronicle_sector_count: 128,
                nano_triangular_max: 16,
            },
            HyperCloud => ProfileTuning {
                ballistic_candidates: 9,
                medic_retry_max: 10,
                backoff_base_us: 2000,
                cortex_probe_depth: 32,
                chronicle_sector_count: 2048,
                nano_triangular_max: 48,
            },
        }
    }
}

/// Per-profile tuning constants consumed by `read`, `medic`, `anchor`, and
/// `chronicle`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProfileTuning {
    /// Number of trajectory candidates Ballistic Read generates per attempt.
    pub ballistic_candidates: u8,
    /// Max Auto-Medic overwrite-then-verify retries before giving up.
    pub medic_retry_max: u8,
    /// Base backoff between medic retries, doubled per attempt.
    pub backoff_base_us: u32,
    /// Max linear-probe depth in the Cortex table.
    pub cortex_probe_depth: u16,
    /// Sectors per Chronicle ring segment.
    pub chronicle_sector_count: u32,
    /// Max triangular-probe steps in the Nano Store.
    pub nano_triangular_max: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_raw() {
        for raw in 0u8..8 {
            let p = FormatProfile::from_raw(raw).unwrap();
            assert_eq!(p as u8, raw);
        }
        assert!(FormatProfile::from_raw(8).is_none());
    }

    #[test]
    fn pico_is_the_most_conservative_profile() {
        let pico = FormatProfile::Pico.tuning();
        let cloud = FormatProfile::HyperCloud.tuning();
        assert!(pico.ballistic_candidates < cloud.ballistic_candidates);
        assert!(pico.cortex_probe_depth < cloud.cortex_probe_depth);
    }
}
