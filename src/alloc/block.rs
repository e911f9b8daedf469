//! Memory blocks: the unit of allocation as seen by the buckets and by
//! `palloc`. A block is either a span of whole chunks (*huge*) or a span of
//! units inside a run. The two variants answer the same questions — size,
//! placement, durable state — and both propose their state transitions
//! exclusively through [`MemBlock::prep_hdr`], which appends redo entries
//! instead of writing media.

use super::layout::{
    self, chunk_hdr_pack, chunk_hdr_unpack, AllocHeader, ChunkType, RunHeader,
};
use super::Mapping;
use crate::result::{Error, Result};
use crate::stm::op::{OpContext, OpKind};
use crate::sync::PMutex;

/// Durable state a block can be driven to.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BlockState {
    Allocated,
    Free,
}

/// A huge block: `size_idx` consecutive chunks starting at `chunk`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HugeBlock {
    pub zone: u32,
    pub chunk: u32,
    pub size_idx: u32,
}

/// A run block: `units` consecutive units starting at `unit` inside the run
/// chunk `chunk`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunBlock {
    pub zone: u32,
    pub chunk: u32,
    pub unit: u32,
    pub units: u32,
    pub unit_size: u32,
}

/// A reserved or recovered block of either kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemBlock {
    Huge(HugeBlock),
    Run(RunBlock),
}

impl MemBlock {
    /// Full block size, allocation header included.
    #[inline]
    pub fn block_size(&self) -> usize {
        match self {
            MemBlock::Huge(h) => h.size_idx as usize * layout::CHUNK_SIZE,
            MemBlock::Run(r) => (r.units * r.unit_size) as usize,
        }
    }

    /// Bytes available to the user.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.block_size() - layout::BLOCK_OVERHEAD
    }

    /// Pool offset of the block's first byte.
    pub fn block_off(&self, m: &Mapping) -> u64 {
        match self {
            MemBlock::Huge(h) => m.zones[h.zone as usize].chunk_off(h.chunk),
            MemBlock::Run(r) => {
                m.zones[r.zone as usize].chunk_off(r.chunk)
                    + layout::RUN_DATA_OFF as u64
                    + (r.unit * r.unit_size) as u64
            }
        }
    }

    /// Pool offset of the user data; always cache-line aligned.
    #[inline]
    pub fn user_off(&self, m: &Mapping) -> u64 {
        self.block_off(m) + layout::BLOCK_OVERHEAD as u64
    }

    /// Pool offset of the allocation header.
    #[inline]
    pub fn hdr_off(&self, m: &Mapping) -> u64 {
        self.block_off(m) + layout::HDR_OFF_IN_BLOCK as u64
    }

    /// The run header of a run block.
    pub fn run_header<'a>(&self, m: &'a Mapping) -> Option<&'a RunHeader> {
        match self {
            MemBlock::Huge(_) => None,
            MemBlock::Run(r) => {
                let off = m.zones[r.zone as usize].chunk_off(r.chunk);
                Some(unsafe { &*m.at::<RunHeader>(off) })
            }
        }
    }

    /// The lock serializing bitmap updates of this block's run, if any.
    #[inline]
    pub fn run_lock<'a>(&self, m: &'a Mapping) -> Option<&'a PMutex> {
        self.run_header(m).map(|h| &h.lock)
    }

    /// The durable state of the block, read from chunk header or bitmap.
    pub fn get_state(&self, m: &Mapping) -> Result<BlockState> {
        match self {
            MemBlock::Huge(h) => {
                let geom = &m.zones[h.zone as usize];
                let (t, _) = chunk_hdr_unpack(m.word(geom.chunk_hdr_off(h.chunk)))?;
                Ok(match t {
                    ChunkType::Used => BlockState::Allocated,
                    ChunkType::Free => BlockState::Free,
                    ChunkType::Run => {
                        return Err(Error::Corruption("huge block on a run chunk"))
                    }
                })
            }
            MemBlock::Run(r) => {
                let hdr = self.run_header(m).unwrap();
                let mut free_bits = 0;
                for (word, mask) in layout::bitmap_masks(r.unit, r.units) {
                    free_bits += (hdr.bitmap[word] & mask).count_ones();
                }
                if free_bits == 0 {
                    Ok(BlockState::Allocated)
                } else if free_bits == r.units {
                    Ok(BlockState::Free)
                } else {
                    Err(Error::Corruption("run block in mixed bitmap state"))
                }
            }
        }
    }

    /// Appends the redo entries that drive this block to `state`. For huge
    /// blocks that is the chunk header word; for run blocks the bitmap
    /// words, resolved through the context so several transitions in one
    /// batch compose.
    pub fn prep_hdr(
        &self,
        m: &Mapping,
        state: BlockState,
        ctx: &mut OpContext,
    ) -> Result<()> {
        match self {
            MemBlock::Huge(h) => {
                let geom = &m.zones[h.zone as usize];
                let t = match state {
                    BlockState::Allocated => ChunkType::Used,
                    BlockState::Free => ChunkType::Free,
                };
                ctx.add_set(geom.chunk_hdr_off(h.chunk), chunk_hdr_pack(t, h.size_idx))
            }
            MemBlock::Run(r) => {
                let chunk_off = m.zones[r.zone as usize].chunk_off(r.chunk);
                let bitmap_off = chunk_off + layout::RUN_BITMAP_OFF as u64;
                for (word, mask) in layout::bitmap_masks(r.unit, r.units) {
                    let off = bitmap_off + 8 * word as u64;
                    match state {
                        BlockState::Allocated => ctx.add(off, !mask, OpKind::And)?,
                        BlockState::Free => ctx.add(off, mask, OpKind::Or)?,
                    }
                }
                Ok(())
            }
        }
    }

    /// Writes the allocation header directly (the block is not durably
    /// allocated yet, so this needs no redo entry) and flushes it.
    pub fn write_alloc_header(&self, m: &Mapping) {
        let (zone, chunk) = match self {
            MemBlock::Huge(h) => (h.zone, h.chunk),
            MemBlock::Run(r) => (r.zone, r.chunk),
        };
        let hdr = AllocHeader {
            chunk_id: chunk as u64,
            size: self.block_size() as u64,
            zone_id: zone,
            _pad: 0,
        };
        unsafe {
            let dst = m.at::<AllocHeader>(self.hdr_off(m));
            *dst = hdr;
            crate::ll::persist(dst as *const u8, layout::ALLOC_HDR_SIZE);
        }
    }

    /// Recovers the block owning the user offset `user_off` from its
    /// allocation header and the chunk metadata.
    pub fn from_user_off(m: &Mapping, user_off: u64) -> Result<MemBlock> {
        if user_off < (layout::HEAP_OFF + layout::BLOCK_OVERHEAD) as u64
            || user_off as usize >= m.size
            || user_off % crate::ll::CACHELINE as u64 != 0
        {
            return Err(Error::Inval("bad user offset"));
        }
        let hdr =
            unsafe { *m.at::<AllocHeader>(user_off - layout::ALLOC_HDR_SIZE as u64) };
        let zone = hdr.zone_id;
        if zone as usize >= m.zones.len() {
            return Err(Error::Corruption("allocation header names no zone"));
        }
        let geom = &m.zones[zone as usize];
        if hdr.chunk_id >= geom.chunks as u64 {
            return Err(Error::Corruption("allocation header names no chunk"));
        }
        let chunk = hdr.chunk_id as u32;
        let (t, size_idx) = chunk_hdr_unpack(m.word(geom.chunk_hdr_off(chunk)))?;
        let block_off = user_off - layout::BLOCK_OVERHEAD as u64;
        match t {
            ChunkType::Used => {
                if block_off != geom.chunk_off(chunk)
                    || hdr.size != (size_idx as usize * layout::CHUNK_SIZE) as u64
                {
                    return Err(Error::Corruption("huge header mismatch"));
                }
                Ok(MemBlock::Huge(HugeBlock {
                    zone,
                    chunk,
                    size_idx,
                }))
            }
            ChunkType::Run => {
                let run = unsafe { &*m.at::<RunHeader>(geom.chunk_off(chunk)) };
                let unit_size = run.block_size as u32;
                let rel = block_off
                    .checked_sub(geom.chunk_off(chunk) + layout::RUN_DATA_OFF as u64)
                    .ok_or(Error::Corruption("run header mismatch"))?;
                if unit_size == 0
                    || hdr.size == 0
                    || rel % unit_size as u64 != 0
                    || hdr.size % unit_size as u64 != 0
                {
                    return Err(Error::Corruption("run header mismatch"));
                }
                let unit = (rel / unit_size as u64) as u32;
                let units = (hdr.size / unit_size as u64) as u32;
                if unit + units > layout::units_per_run(unit_size as usize) {
                    return Err(Error::Corruption("run block out of bounds"));
                }
                Ok(MemBlock::Run(RunBlock {
                    zone,
                    chunk,
                    unit,
                    units,
                    unit_size,
                }))
            }
            ChunkType::Free => Err(Error::Corruption("allocation on a free chunk")),
        }
    }
}
