//! The persistent allocator: pool mapping and superblock management
//! ([`pool`]), on-media heap layout ([`layout`]), the volatile bucket index
//! ([`bucket`]), the memory-block sum type ([`block`]) and the unified
//! allocate/free/reallocate operation ([`palloc`]).

pub(crate) mod block;
pub(crate) mod bucket;
pub mod layout;
pub mod palloc;
pub mod pool;

pub use pool::{Pool, PoolStats};

use layout::ZoneGeom;

/// Volatile view of one mapped pool: the virtual base for this process
/// lifetime plus the computed zone geometry. All typed access to media goes
/// through here so offset arithmetic lives in one place.
pub(crate) struct Mapping {
    pub base: *mut u8,
    pub size: usize,
    pub zones: Vec<ZoneGeom>,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Raw pointer to the object at pool offset `off`.
    ///
    /// # Safety
    /// `off..off + size_of::<T>()` must lie inside the pool and hold a `T`.
    #[inline]
    pub unsafe fn at<T>(&self, off: u64) -> *mut T {
        debug_assert!(off as usize + std::mem::size_of::<T>() <= self.size);
        self.base.add(off as usize) as *mut T
    }

    /// Reads the 8-byte word at `off`.
    #[inline]
    pub fn word(&self, off: u64) -> u64 {
        unsafe { *self.at::<u64>(off) }
    }

    /// True when `off` may legally be the target of a redo entry: an
    /// 8-byte word inside the pool but outside the redo area itself.
    pub fn redo_target_ok(&self, off: u64) -> bool {
        let off = off as usize;
        let in_redo = off >= layout::REDO_OFF as usize && off < layout::HEAP_OFF;
        off % 8 == 0 && off + 8 <= self.size && !in_redo
    }
}
