//! On-media representation of the pool: superblock, redo area, heap zones,
//! chunk headers, run headers with their occupancy bitmaps, and the
//! allocation header prefixed to every block. Everything here is plain
//! `repr(C)` data addressed by pool-relative offsets.
//!
//! ```text
//! +-------------+-------------+----------------------------------------+
//! | superblock  |  redo log   |  zone 0 [hdr | chunk hdrs | chunks...] |
//! |   4 KiB     |   4 KiB     |  (further zones for very large pools)  |
//! +-------------+-------------+----------------------------------------+
//! ```

use crate::ptr::PRef;
use crate::result::{Error, Result};
use crate::sync::PMutex;

/// Layout version stamped into the superblock.
pub const LAYOUT_VERSION: u64 = 1;

/// The superblock occupies the first 4 KiB of the pool.
pub const SUPERBLOCK_SIZE: usize = 4096;

/// Pool offset of the redo-log entry array.
pub const REDO_OFF: u64 = SUPERBLOCK_SIZE as u64;

/// Payload entries per redo batch; with the checksum entry the durable area
/// is exactly one page.
pub const REDO_CAPACITY: usize = 255;

/// Size of the durable redo area.
pub const REDO_AREA_SIZE: usize = (REDO_CAPACITY + 1) * 16;

/// Pool offset of the first heap zone.
pub const HEAP_OFF: usize = SUPERBLOCK_SIZE + REDO_AREA_SIZE;

/// Fundamental unit of heap bookkeeping.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Upper bound on chunks per zone; larger pools grow more zones.
pub const ZONE_MAX_CHUNKS: u32 = 65528;

const ZONE_HDR_SIZE: usize = 64;
const ZONE_MAGIC: u64 = 0x706d_656d_7a6f_6e65; // "pmemzone"

/// Words in a run's occupancy bitmap (2048 units max per run).
pub const RUN_BITMAP_WORDS: usize = 32;

/// Offset of the first unit inside a run chunk; the header and bitmap live
/// below it.
pub const RUN_DATA_OFF: usize = 512;

/// Unit sizes of the run-backed size classes. A request is served by the
/// largest class not exceeding it, in one or more contiguous units.
pub const RUN_UNIT_SIZES: [usize; 5] = [128, 512, 2048, 8192, 32768];

/// Header-inclusive sizes above this go straight to whole chunks.
pub const RUN_MAX_ALLOC: usize = 65536;

/// Bytes of every block spent before user data: bytes `40..64` hold the
/// allocation header, so user data starts cache-line aligned and the header
/// sits immediately before it.
pub const BLOCK_OVERHEAD: usize = 64;

/// Offset of the allocation header within its block.
pub const HDR_OFF_IN_BLOCK: usize = 40;

/// `user_off - ALLOC_HDR_SIZE` recovers the allocation header.
pub const ALLOC_HDR_SIZE: usize = 24;

// ---------------------------------------------------------------------------
// chunk headers

/// Durable state of a chunk, encoded in the low byte of its header word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkType {
    /// One or more consecutive unused chunks.
    Free = 1,
    /// Occupied by a single huge allocation.
    Used = 2,
    /// Subdivided into fixed-size units of one size class.
    Run = 3,
}

/// Packs a chunk header word: type in bits 0..8, span in bits 8..40.
#[inline]
pub fn chunk_hdr_pack(t: ChunkType, size_idx: u32) -> u64 {
    (t as u64) | ((size_idx as u64) << 8)
}

/// Unpacks a chunk header word; an unknown type byte is corruption.
#[inline]
pub fn chunk_hdr_unpack(word: u64) -> Result<(ChunkType, u32)> {
    let size_idx = (word >> 8) as u32;
    match word as u8 {
        1 => Ok((ChunkType::Free, size_idx)),
        2 => Ok((ChunkType::Used, size_idx)),
        3 => Ok((ChunkType::Run, size_idx)),
        _ => Err(Error::Corruption("unknown chunk type")),
    }
}

// ---------------------------------------------------------------------------
// zone geometry

/// Durable header at the start of each zone.
#[repr(C)]
pub struct ZoneHeader {
    pub magic: u64,
    pub chunk_count: u32,
    _pad: u32,
    _reserved: [u8; ZONE_HDR_SIZE - 16],
}

impl ZoneHeader {
    pub fn init(&mut self, chunk_count: u32) {
        self.magic = ZONE_MAGIC;
        self.chunk_count = chunk_count;
        self._pad = 0;
        self._reserved = [0; ZONE_HDR_SIZE - 16];
    }

    pub fn check(&self) -> Result<()> {
        if self.magic != ZONE_MAGIC || self.chunk_count == 0 {
            return Err(Error::Corruption("bad zone header"));
        }
        Ok(())
    }
}

/// Computed placement of one zone inside the pool.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ZoneGeom {
    /// Pool offset of the zone header.
    pub off: usize,
    /// Chunks owned by this zone.
    pub chunks: u32,
    /// Pool offset of chunk 0's data.
    pub data_off: usize,
}

impl ZoneGeom {
    /// Pool offset of the header word for `chunk_id`.
    #[inline]
    pub fn chunk_hdr_off(&self, chunk_id: u32) -> u64 {
        (self.off + ZONE_HDR_SIZE + 8 * chunk_id as usize) as u64
    }

    /// Pool offset of the data of `chunk_id`.
    #[inline]
    pub fn chunk_off(&self, chunk_id: u32) -> u64 {
        (self.data_off + chunk_id as usize * CHUNK_SIZE) as u64
    }

    fn meta_len(chunks: u32) -> usize {
        round_up(ZONE_HDR_SIZE + 8 * chunks as usize, 4096)
    }
}

#[inline]
fn round_up(x: usize, to: usize) -> usize {
    (x + to - 1) & !(to - 1)
}

/// Splits the heap area of a `pool_size`-byte pool into zones. Fails when
/// the pool cannot host even one chunk.
pub fn zone_geometry(pool_size: usize) -> Result<Vec<ZoneGeom>> {
    let mut zones = Vec::new();
    let mut off = HEAP_OFF;
    while off < pool_size {
        let avail = pool_size - off;
        let mut chunks =
            std::cmp::min((avail / CHUNK_SIZE) as u32, ZONE_MAX_CHUNKS);
        while chunks > 0
            && ZoneGeom::meta_len(chunks) + chunks as usize * CHUNK_SIZE > avail
        {
            chunks -= 1;
        }
        if chunks == 0 {
            break;
        }
        let data_off = off + ZoneGeom::meta_len(chunks);
        zones.push(ZoneGeom {
            off,
            chunks,
            data_off,
        });
        off = data_off + chunks as usize * CHUNK_SIZE;
    }
    if zones.is_empty() {
        return Err(Error::Inval("pool too small for a single chunk"));
    }
    Ok(zones)
}

// ---------------------------------------------------------------------------
// runs

/// Durable header at the start of a run chunk; units follow at
/// [`RUN_DATA_OFF`]. A set bitmap bit means the unit is free; reserving
/// clears bits, freeing sets them. Bits past the last real unit stay
/// permanently clear.
#[repr(C)]
pub struct RunHeader {
    pub lock: PMutex,
    pub block_size: u64,
    pub bitmap: [u64; RUN_BITMAP_WORDS],
}

/// Byte offset of the bitmap within a [`RunHeader`], used when a bitmap
/// word becomes the target of a redo entry.
pub const RUN_BITMAP_OFF: usize = 72;

/// Units a run of `unit_size` provides.
#[inline]
pub fn units_per_run(unit_size: usize) -> u32 {
    ((CHUNK_SIZE - RUN_DATA_OFF) / unit_size) as u32
}

/// The size class serving a header-inclusive size, or `None` for huge.
#[inline]
pub fn class_for_size(asize: usize) -> Option<usize> {
    if asize > RUN_MAX_ALLOC {
        return None;
    }
    let mut class = 0;
    for (i, unit) in RUN_UNIT_SIZES.iter().enumerate() {
        if *unit <= asize {
            class = i;
        }
    }
    Some(class)
}

/// Chunks a huge allocation of `asize` bytes spans.
#[inline]
pub fn chunks_for_size(asize: usize) -> u32 {
    ((asize + CHUNK_SIZE - 1) / CHUNK_SIZE) as u32
}

/// Per-word masks covering bitmap bits `unit..unit + n`.
pub fn bitmap_masks(unit: u32, n: u32) -> Vec<(usize, u64)> {
    let mut masks = Vec::new();
    let mut bit = unit as usize;
    let end = (unit + n) as usize;
    while bit < end {
        let word = bit / 64;
        let lo = bit % 64;
        let hi = std::cmp::min(end - word * 64, 64);
        let mask = if hi - lo == 64 {
            u64::MAX
        } else {
            ((1u64 << (hi - lo)) - 1) << lo
        };
        masks.push((word, mask));
        bit = word * 64 + hi;
    }
    masks
}

// ---------------------------------------------------------------------------
// allocation header

/// 24-byte prefix stored immediately before user data. `size` is the full
/// rounded block size, header included, so it always equals
/// `size_idx * unit_size` of the owning chunk.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AllocHeader {
    pub chunk_id: u64,
    pub size: u64,
    pub zone_id: u32,
    pub _pad: u32,
}

// ---------------------------------------------------------------------------
// superblock

/// The durable root of the pool, fixed at offset 0. `initialized` is the
/// final byte written by pool creation; a pool observed with it clear is
/// half-formatted. `inode_cnt` backs pool statistics and is updated only
/// through redo entries.
#[repr(C)]
pub struct Superblock {
    pub version: u64,
    pub root_inode: PRef<crate::fs::inode::Inode>,
    pub orphaned_inodes: PRef<crate::fs::orphan::InodeArray>,
    pub initialized: u8,
    _pad0: [u8; 7],
    pub inode_cnt: u64,
    _pad: [u8; SUPERBLOCK_SIZE - 56],
}

impl Superblock {
    /// Byte offset of `initialized` within the pool.
    pub const INITIALIZED_OFF: usize = 40;

    /// Pool offset of the `inode_cnt` word.
    pub const INODE_CNT_OFF: u64 = 48;

    /// Pool offset of the root-object reference.
    pub const ROOT_OFF: u64 = 8;

    /// Pool offset of the orphaned-inode list head reference.
    pub const ORPHANS_OFF: u64 = 24;
}

const _: [(); SUPERBLOCK_SIZE] = [(); std::mem::size_of::<Superblock>()];
const _: [(); ALLOC_HDR_SIZE] = [(); std::mem::size_of::<AllocHeader>()];
const _: [(); 16] = [(); std::mem::size_of::<crate::stm::redo::RedoEntry>()];
