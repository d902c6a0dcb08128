//! Error taxonomy (§7).
//!
//! One enum covers every error named in `spec.md`. Validation errors are
//! returned immediately; I/O errors are retried per the policies in
//! `router` and `read` and otherwise surfaced; integrity errors on reads
//! feed `medic`; consistency failures set `Volume` panic and, on the mount
//! path, force read-only rather than refusing to mount.
//!
//! Informational successes (`pending`, `healed`, `sparse`,
//! `horizon-fallback`, `thawed`) are not variants of this enum — they are
//! not failures. They are carried by [`Outcome`].

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EngineError {
    // Space
    Enospc,
    EventHorizon,
    GravityCollapse,
    BitmapCorrupt,
    AlignmentFail,
    AtomicsTimeout,
    ZoneFull,
    WipePending,
    // Identity
    NotFound,
    Tombstone,
    IdMismatch,
    TagOverflow,
    NameTooLong,
    // Security
    AccessDenied,
    Immutable,
    SigInvalid,
    TetherExpired,
    NotSovereign,
    VolumeLocked,
    AuditFailure,
    // Integrity
    HwIo,
    DataRot,
    HeaderRot,
    PayloadRot,
    EncryptedRot,
    ParityBroken,
    PhantomBlock,
    DecompressFail,
    ThermalCritical,
    CpuInsanity,
    MediaToxic,
    // Time/State
    GenerationSkew,
    EpochLost,
    SnapshotInvalid,
    QuantumViolation,
    TimeDilation,
    Tampered,
    TimeParadox,
    // System
    BadSuperblock,
    VersionIncompat,
    Nomem,
    DmaMapping,
    ProfileMismatch,
    PicoLimit,
    EndianMismatch,
    InternalFault,
    Geometry,
    InvalidArgument,
    Uninitialized,
    Eexist,
    CompressionInefficient,
    AlgoUnknown,
    KeyExpired,
    Busy,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

/// An informational code attached to a success. These are success with a
/// caveat — the caller should usually proceed but may want to log or act on
/// the caveat (e.g. `Healed` means a medic repair happened mid-read).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Caveat {
    Pending,
    Healed,
    Sparse,
    HorizonFallback,
    Thawed,
}

/// A successful result that may carry an informational caveat.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub caveat: Option<Caveat>,
}

impl<T> Outcome<T> {
    #[inline]
    pub fn ok(value: T) -> Self {
        Outcome { value, caveat: None }
    }

    #[inline]
    pub fn with(value: T, caveat: Caveat) -> Self {
        Outcome { value, caveat: Some(caveat) }
    }

    #[inline]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome { value: f(self.value), caveat: self.caveat }
    }
}

/// Weighted priority table used to merge errors across Ballistic Read
/// candidates (spec §4.7 step 9). Lower rank = reported first on a tie of
/// severity; ties otherwise preserve the causal first error.
const fn error_weight(e: EngineError) -> u32 {
    use EngineError::*;
    match e {
        CpuInsanity => 0,
        HwIo => 1,
        Nomem => 2,
        GenerationSkew => 3,
        PhantomBlock => 4,
        HeaderRot => 5,
        PayloadRot => 5,
        DataRot => 5,
        EncryptedRot => 5,
        DecompressFail => 6,
        IdMismatch => 7,
        VersionIncompat => 8,
        NotFound => 9,
        _ => 100,
    }
}

/// Merge two candidate errors from Ballistic Read, keeping the
/// higher-priority (lower weight) one; on a tie, keep `first` (the causal
/// first error), per spec §4.7 step 9.
pub fn merge_errors(first: EngineError, second: EngineError) -> EngineError {
    if error_weight(second) < error_weight(first) {
        second
    } else {
        first
    }
}
