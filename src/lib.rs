//! # Cortex Engine
//!
//! A block-addressed persistent storage engine built around a
//! content-addressed, hashed-slot metadata table (the "Cortex") instead of
//! a directory tree. Every stored object is reached through a 128-byte
//! [`anchor::Anchor`] record; the engine never assumes a filesystem
//! namespace above that layer — path resolution and tensor-tag lookup are
//! external collaborator contracts (see [`hal::NamespaceResolver`]).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Volume (owning handle)                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Mount State Machine (mount, volume)                             │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐               │
//! │  │  Cardinal   │ │   Epoch     │ │  Root Anchor│               │
//! │  │  Vote (SB)  │ │   Ring      │ │   Manager   │               │
//! │  └─────────────┘ └─────────────┘ └─────────────┘               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Cortex Table (anchor, qmask, bitmap)              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Ballistic Read (read)   │  Auto-Medic (medic)  │ Nano Store     │
//! │  Spatial Router (router) │  GF(2^8) (gf256)     │ Tensor (tensor)│
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Chronicle (append-only audit ring)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Block Device (hal)                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## On-disk layout
//!
//! ```text
//! 4 Cardinal superblocks (North/East/West/South), scattered by capacity
//! Epoch Ring   -> Cortex Table -> Occupancy Bitmap -> Q-Mask Table
//! Flux/Horizon regions -> Stream region -> Chronicle journal ring
//! ```

#![no_std]
#![allow(dead_code)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// ============================================================================
// Module exports
// ============================================================================

pub mod anchor;
pub mod bitmap;
pub mod cache;
pub mod chronicle;
pub mod crc32c;
pub mod epoch;
pub mod error;
pub mod gf256;
pub mod hal;
pub mod hash;
pub mod medic;
pub mod mount;
pub mod nano;
pub mod profile;
pub mod qmask;
pub mod read;
pub mod root_anchor;
pub mod router;
pub mod superblock;
pub mod tensor;
pub mod types;
pub mod volume;

#[cfg(feature = "std")]
pub mod testkit;

// Re-exports for convenience.
pub use crate::error::{Caveat, EngineError, EngineResult, Outcome};
pub use crate::superblock::Superblock;
pub use crate::types::{Address, Id128};
pub use crate::volume::Volume;

/// Engine version information.
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const VERSION_PATCH: u16 = 0;
pub const VERSION_STRING: &str = "1.0.0";
