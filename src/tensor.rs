//! Tensor Stream View: sorted-shard prefix-sum virtualization over a
//! tagged set of anchors (C10, §4.9).
//!
//! A tensor context gathers every anchor matching a tag (up to the engine's
//! shard limit), sorts the set by seed-id so a binary search can find the
//! shard owning any global offset, and caches prefix-sum byte offsets so a
//! read never has to re-sum masses. Reads then fan out per-block to
//! Ballistic Read.
//!
//! The per-anchor gather loop has no direct teacher precedent; it's this
//! crate's own sequencing of the collaborators `open()` already needs
//! (resolver, then one decode per address, then a sort). The gather reads
//! and the per-block fan-out both go through [`crate::router::route`], the
//! same chokepoint Auto-Medic and Ballistic Read use.

use crate::anchor::{Anchor, Permissions, ANCHOR_SIZE};
use crate::error::{EngineError, EngineResult};
use crate::hal::{BlockDevice, Compressor, Crc32cProvider, IoOp, NamespaceResolver, TrajectoryHelper};
use crate::medic::MedicCounters;
use crate::qmask::QMaskTable;
use crate::read::{self, ReadContext, BLOCK_HEADER_SIZE};
use crate::router::{self, RouteOp, RouteTarget};
use crate::types::{Address, Id128};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

/// Above this many matching anchors the gather is ambiguous: the caller
/// cannot tell whether the tag truly has exactly this many members or more
/// were truncated, so open() refuses with [`EngineError::TagOverflow`].
pub const TAG_SHARD_LIMIT: usize = 4096;

#[derive(Debug)]
struct Shard {
    anchor: Anchor,
}

/// An open view over a tagged, sorted set of anchors, addressed as one
/// flat byte stream.
#[derive(Debug)]
pub struct TensorContext<'a> {
    shards: Vec<Shard>,
    /// Prefix-sum byte offsets, length `shards.len() + 1`.
    offsets: Vec<u64>,
    payload_capacity: u64,
    ref_count: &'a AtomicU32,
}

fn seed_key(id: Id128) -> (u128, u128) {
    (id.hi() as u128, id.lo() as u128)
}

/// Gather, sort, and index a tagged anchor set. Bumps `ref_count` on
/// success; the caller must pair this with [`close`].
pub fn open<'a, R: NamespaceResolver, D: BlockDevice>(
    resolver: &R,
    device: &D,
    tag: &str,
    sector_size: u32,
    ref_count: &'a AtomicU32,
) -> EngineResult<TensorContext<'a>> {
    let mut addrs = alloc::vec![Address::ZERO; TAG_SHARD_LIMIT];
    let count = resolver.gather_tensor_shards(tag, &mut addrs)?;
    if count == TAG_SHARD_LIMIT {
        return Err(EngineError::TagOverflow);
    }

    let payload_capacity = (sector_size as u64).saturating_sub(BLOCK_HEADER_SIZE as u64);
    if payload_capacity == 0 {
        return Err(EngineError::Geometry);
    }

    let route_target = RouteTarget::Single(device);
    let mut anchors = Vec::with_capacity(count);
    for addr in &addrs[..count] {
        let mut sector = alloc::vec![0u8; sector_size as usize];
        router::route(&route_target, RouteOp::Read, *addr, &mut sector, 1, Id128::ZERO)?;
        let mut raw = [0u8; ANCHOR_SIZE];
        raw.copy_from_slice(&sector[..ANCHOR_SIZE]);
        anchors.push(Anchor::decode(&raw)?);
    }
    anchors.sort_by_key(|a| seed_key(a.seed_id));

    let mut offsets = Vec::with_capacity(anchors.len() + 1);
    offsets.push(0u64);
    let mut running = 0u64;
    for a in &anchors {
        if a.mass == 0 {
            return Err(EngineError::DataRot);
        }
        running = running.checked_add(a.mass).ok_or(EngineError::Geometry)?;
        offsets.push(running);
    }

    ref_count.fetch_add(1, Ordering::AcqRel);
    Ok(TensorContext {
        shards: anchors.into_iter().map(|anchor| Shard { anchor }).collect(),
        offsets,
        payload_capacity,
        ref_count,
    })
}

impl<'a> TensorContext<'a> {
    pub fn total_size(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Locate the shard owning `global_offset`, returning its index and
    /// the offset within the shard.
    fn locate(&self, global_offset: u64) -> Option<(usize, u64)> {
        if self.shards.is_empty() {
            return None;
        }
        // partition_point over offsets[1..] for the first boundary
        // strictly greater than global_offset.
        let idx = self.offsets.partition_point(|&o| o <= global_offset);
        if idx == 0 || idx > self.shards.len() {
            return None;
        }
        let shard_idx = idx - 1;
        Some((shard_idx, global_offset - self.offsets[shard_idx]))
    }

    /// Read up to `buf.len()` bytes starting at `global_offset`, clamped
    /// to the end of the stream. Returns the number of bytes copied.
    #[allow(clippy::too_many_arguments)]
    pub fn read<D, C, X, T>(
        &self,
        ctx: &ReadContext<'_, D, C, X, T>,
        global_offset: u64,
        buf: &mut [u8],
        session_permissions: Permissions,
        qmask: Option<(&QMaskTable, &MedicCounters<'_>)>,
    ) -> EngineResult<usize>
    where
        D: BlockDevice,
        C: Crc32cProvider,
        X: Compressor,
        T: TrajectoryHelper,
    {
        let total = self.total_size();
        if global_offset >= total {
            return Err(EngineError::InvalidArgument);
        }
        let want = (buf.len() as u64).min(total - global_offset) as usize;
        let mut written = 0usize;
        let mut offset = global_offset;

        while written < want {
            let (shard_idx, within_shard) = self.locate(offset).ok_or(EngineError::NotFound)?;
            let shard = &self.shards[shard_idx];
            let block_index = within_shard / self.payload_capacity;
            let offset_in_block = (within_shard % self.payload_capacity) as usize;

            let mut bounce = alloc::vec![0u8; self.payload_capacity as usize];
            read::read_block_atomic(ctx, &shard.anchor, block_index, &mut bounce, session_permissions, qmask)?;

            let available_in_block = self.payload_capacity as usize - offset_in_block;
            let remaining_in_shard = (shard.anchor.mass - within_shard) as usize;
            let take = (want - written).min(available_in_block).min(remaining_in_shard);
            buf[written..written + take].copy_from_slice(&bounce[offset_in_block..offset_in_block + take]);

            written += take;
            offset += take as u64;
            // bounce is dropped here, freeing the per-block buffer before
            // the next iteration allocates a fresh one.
        }
        Ok(written)
    }

    /// Release the context: decrement the ref-count and scrub this
    /// struct's anchor/offset memory before it is dropped.
    pub fn close(mut self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);
        for shard in &mut self.shards {
            let scrubbed = Anchor::empty();
            shard.anchor = scrubbed;
        }
        for o in &mut self.offsets {
            *o = 0xDDDD_DDDD_DDDD_DDDDu64;
        }
    }
}
