//! The persistent memory pool: a memory-mapped file whose first page is the
//! durable superblock, followed by the redo-log area and the heap zones.
//! Opening a pool runs redo recovery before anything else, re-arms every
//! persistent mutex, and rebuilds the transient bucket index from chunk
//! metadata. All persistent references are pool-relative offsets; the pool
//! object is the capability that turns them into live references.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use memmap::MmapMut;

use super::bucket::Heap;
use super::layout::{
    self, chunk_hdr_pack, zone_geometry, ChunkType, Superblock, ZoneHeader,
    REDO_CAPACITY, REDO_OFF,
};
use super::palloc::{self, Constructor};
use super::Mapping;
use crate::fs::inode::Inode;
use crate::fs::orphan::InodeArray;
use crate::fs::vinode::VinodeSet;
use crate::ll;
use crate::ptr::{PRef, PType};
use crate::result::{Error, Result};
use crate::stm::op::OpContext;
use crate::stm::redo::RedoLog;

/// Default pool memory size to be used while creating a new pool
pub const DEFAULT_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// Open pool flags
pub mod open_flags {
    /// Open Flag: Create the pool memory file
    pub const O_C: u32 = 0x00000001;

    /// Open Flag: Formats the pool memory file if file exists, otherwise error
    pub const O_F: u32 = 0x00000002;

    /// Open Flag: Creates pool memory file only if it does not exist
    pub const O_CNE: u32 = 0x00000004;

    /// Open Flag: Creates and formats a new file
    pub const O_CF: u32 = O_C | O_F;

    /// Open Flag: Creates and formats pool memory file only if it does not exist
    pub const O_CFNE: u32 = O_CNE | O_F;

    /// Open Flag: Creates a pool memory file of size 16MB
    pub const O_16MB: u32 = 16 << 4;

    /// Open Flag: Creates a pool memory file of size 64MB
    pub const O_64MB: u32 = 64 << 4;

    /// Open Flag: Creates a pool memory file of size 256MB
    pub const O_256MB: u32 = 256 << 4;

    /// Open Flag: Creates a pool memory file of size 1GB
    pub const O_1GB: u32 = 1024 << 4;
}

pub use open_flags::*;

lazy_static! {
    /// Process-wide set of open pool files, consulted only at open/close.
    static ref REGISTRY: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// Counts reported by [`Pool::stats`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PoolStats {
    pub pool_size: usize,
    pub total_chunks: u32,
    pub free_chunks: u32,
    pub inodes: u64,
}

/// An open persistent memory pool.
pub struct Pool {
    path: PathBuf,
    #[allow(dead_code)]
    map: MmapMut,
    m: Mapping,
    heap: Heap,
    redo: Mutex<RedoLog>,
    cwd: RwLock<PRef<Inode>>,
    pub(crate) vinodes: VinodeSet,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("path", &self.path).finish()
    }
}

impl Pool {
    /// Opens a pool file, applying the open flags first.
    ///
    /// # Flags
    ///   * O_C:    create a memory pool file if not exists
    ///   * O_F:    format the memory pool file
    ///   * O_CNE:  create a memory pool file only if it does not exist
    ///   * O_CF:   create and format a new memory pool file
    ///   * O_CFNE: create and format a memory pool file only if not exists
    ///
    /// See [`open_flags`] for the size flags accepted alongside a create
    /// flag.
    pub fn open<P: AsRef<Path>>(path: P, flags: u32) -> Result<Pool> {
        let path = path.as_ref();
        Self::apply_flags(path, flags)?;
        Self::boot(path)
    }

    /// Applies open pool flags: creates and/or formats the file.
    fn apply_flags(path: &Path, flags: u32) -> Result<()> {
        let mut size: u64 = (flags as u64) >> 4;
        if size.count_ones() > 1 {
            return Err(Error::Inval("multiple size flags"));
        } else if size == 0 {
            size = DEFAULT_POOL_SIZE;
        } else {
            if flags & (O_C | O_CNE) == 0 {
                return Err(Error::Inval("size flag without a create flag"));
            }
            size <<= 20;
        }
        let exists = path.exists();
        let mut format = exists && (flags & O_F) != 0 && (flags & O_CNE) == 0;
        if (flags & O_C) != 0 || ((flags & O_CNE) != 0 && !exists) {
            let _ = std::fs::remove_file(path);
            create_file(path, size)?;
            format = (flags & O_F) != 0;
        }
        if format {
            Self::format(path)?;
        }
        Ok(())
    }

    /// Formats an existing pool file in place. Everything the file held is
    /// lost; the superblock's `initialized` byte is the last word written.
    pub fn format<P: AsRef<Path>>(path: P) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let size = file.metadata()?.len() as usize;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        let zones = zone_geometry(size)?;

        unsafe {
            // Scrub the control area so stale superblock or redo bytes can
            // never be mistaken for live state.
            ll::memset_persist(base, 0, layout::HEAP_OFF);

            for geom in &zones {
                let zh = &mut *(base.add(geom.off) as *mut ZoneHeader);
                zh.init(geom.chunks);
                ll::flush_obj(zh);
                // One free span covering the whole zone; interior header
                // words are never read.
                let hdr = base.add(geom.off + 64) as *mut u64;
                std::ptr::write_bytes(hdr, 0, geom.chunks as usize);
                *hdr = chunk_hdr_pack(ChunkType::Free, geom.chunks);
                ll::flush(hdr as *const u8, 8 * geom.chunks as usize);
            }
            ll::drain();

            let sb = &mut *(base as *mut Superblock);
            sb.version = layout::LAYOUT_VERSION;
            sb.root_inode = PRef::null();
            sb.orphaned_inodes = PRef::null();
            sb.inode_cnt = 0;
            ll::persist(base, Superblock::INITIALIZED_OFF);

            // The final word of formatting; everything above is already
            // durable when it lands.
            sb.initialized = 1;
            ll::persist(base.add(Superblock::INITIALIZED_OFF), 1);
        }
        map.flush()?;
        Ok(())
    }

    /// Maps an existing, formatted pool: superblock checks, redo recovery,
    /// persistent-mutex re-arming and bucket rebuild, in that order.
    fn boot(path: &Path) -> Result<Pool> {
        let canonical = path.canonicalize()?;
        {
            let mut reg = REGISTRY.lock().unwrap();
            if !reg.insert(canonical.clone()) {
                return Err(Error::Inval("pool is already open"));
            }
        }
        let res = Self::boot_inner(path, canonical.clone());
        if res.is_err() {
            REGISTRY.lock().unwrap().remove(&canonical);
        }
        res
    }

    fn boot_inner(path: &Path, canonical: PathBuf) -> Result<Pool> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        let m = Mapping {
            base,
            size,
            zones: zone_geometry(size)?,
        };

        let sb = unsafe { &*m.at::<Superblock>(0) };
        if sb.initialized == 0 {
            return Err(Error::Corruption("pool is half-formatted"));
        }
        if sb.version != layout::LAYOUT_VERSION {
            return Err(Error::Corruption("unknown layout version"));
        }

        // Recovery runs before any client work can observe the heap.
        let mut redo = RedoLog::new(base, REDO_OFF, REDO_CAPACITY);
        redo.recover(&|off| m.redo_target_ok(off))?;

        // Re-arm the persistent mutexes of the orphan list; run locks are
        // re-armed by the bucket rebuild walk. Back links are repaired here
        // because segment insertion publishes the forward link first.
        let mut cur = sb.orphaned_inodes;
        let mut expected_prev: PRef<InodeArray> = PRef::null();
        while !cur.is_null() {
            let arr = unsafe { &mut *m.at::<InodeArray>(cur.off()) };
            arr.mutex.init();
            if arr.prev != expected_prev {
                arr.prev = expected_prev;
                ll::persist_obj(&arr.prev);
            }
            expected_prev = cur;
            cur = arr.next;
        }

        let heap = Heap::rebuild(&m)?;
        let root = sb.root_inode;
        Ok(Pool {
            path: canonical,
            map,
            m,
            heap,
            redo: Mutex::new(redo),
            cwd: RwLock::new(root),
            vinodes: VinodeSet::new(),
        })
    }

    /// A fresh operation context sized to the redo log.
    pub fn new_ctx(&self) -> OpContext {
        OpContext::new(self.m.base, REDO_CAPACITY)
    }

    /// Commits an operation context through the pool's redo log.
    pub fn operation_process(&self, ctx: &mut OpContext) -> Result<()> {
        let mut redo = self.redo.lock().unwrap();
        ctx.process(&mut redo)
    }

    /// The unified allocate/free/reallocate operation; see
    /// [`palloc_operation`](super::palloc::palloc_operation) for the case
    /// table.
    pub fn palloc(
        &self,
        existing_off: u64,
        dest_off: Option<u64>,
        size: usize,
        constructor: Option<Constructor<'_>>,
        ctx: &mut OpContext,
    ) -> Result<u64> {
        palloc::palloc_operation(
            &self.m,
            &self.heap,
            &self.redo,
            existing_off,
            dest_off,
            size,
            constructor,
            ctx,
        )
    }

    /// The durable root object reference.
    pub fn root(&self) -> PRef<Inode> {
        unsafe { &*self.m.at::<Superblock>(0) }.root_inode
    }

    /// Stages a root update; durable once `ctx` is processed.
    pub fn set_root(&self, root: PRef<Inode>, ctx: &mut OpContext) -> Result<()> {
        ctx.add_set(Superblock::ROOT_OFF, root.type_num())?;
        ctx.add_set(Superblock::ROOT_OFF + 8, root.off())
    }

    /// The volatile current-working-directory slot guarded by the pool
    /// rwlock (held while choosing the parent for a path).
    pub fn cwd(&self) -> &RwLock<PRef<Inode>> {
        &self.cwd
    }

    /// Dereferences a typed persistent reference.
    pub fn deref<T: PType>(&self, r: PRef<T>) -> Result<&T> {
        if r.is_null() || r.off() as usize + std::mem::size_of::<T>() > self.m.size {
            return Err(Error::Inval("dangling persistent reference"));
        }
        if r.type_num() != T::TYPE_NUM {
            return Err(Error::Corruption("type number mismatch"));
        }
        Ok(unsafe { &*self.m.at::<T>(r.off()) })
    }

    /// Reads the durable 8-byte word at `off`; test and debugging aid.
    pub fn word(&self, off: u64) -> u64 {
        self.m.word(off)
    }

    /// Raw user bytes of an allocation, for collaborator reads.
    pub fn user_slice(&self, off: u64, len: usize) -> Result<&[u8]> {
        if off as usize + len > self.m.size {
            return Err(Error::Inval("slice out of pool"));
        }
        Ok(unsafe { std::slice::from_raw_parts(self.m.at::<u8>(off), len) })
    }

    /// Mutable user bytes of an allocation. The caller persists what it
    /// writes.
    pub fn user_slice_mut(&self, off: u64, len: usize) -> Result<&mut [u8]> {
        if off as usize + len > self.m.size {
            return Err(Error::Inval("slice out of pool"));
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.m.at::<u8>(off), len) })
    }

    /// Pool occupancy counters.
    pub fn stats(&self) -> PoolStats {
        let sb = unsafe { &*self.m.at::<Superblock>(0) };
        PoolStats {
            pool_size: self.m.size,
            total_chunks: self.m.zones.iter().map(|z| z.chunks).sum(),
            free_chunks: self.heap.free_chunks(),
            inodes: sb.inode_cnt,
        }
    }

    #[inline]
    pub(crate) fn mapping(&self) -> &Mapping {
        &self.m
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let _ = self.map.flush();
        REGISTRY.lock().unwrap().remove(&self.path);
    }
}

pub(crate) fn create_file(path: &Path, size: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).create(true).open(path)?;
    file.set_len(size)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alloc::layout::{AllocHeader, BLOCK_OVERHEAD, CHUNK_SIZE};

    pub(crate) fn test_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("pmemheap-{}-{}.pool", name, std::process::id()));
        p
    }

    fn fresh(name: &str) -> (PathBuf, Pool) {
        let path = test_path(name);
        let _ = std::fs::remove_file(&path);
        let pool = Pool::open(&path, O_CF).unwrap();
        (path, pool)
    }

    #[test]
    fn create_and_reopen() {
        let (path, pool) = fresh("create");
        let stats = pool.stats();
        assert!(stats.total_chunks >= 28);
        assert_eq!(stats.free_chunks, stats.total_chunks);
        assert_eq!(stats.inodes, 0);
        drop(pool);

        let pool = Pool::open(&path, 0).unwrap();
        assert!(pool.root().is_null());
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn half_formatted_pool_is_rejected() {
        let path = test_path("halfformat");
        let _ = std::fs::remove_file(&path);
        create_file(&path, DEFAULT_POOL_SIZE).unwrap();
        // Never formatted: initialized stays zero.
        let err = Pool::open(&path, 0).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn double_open_is_refused() {
        let (path, pool) = fresh("doubleopen");
        let err = Pool::open(&path, 0).unwrap_err();
        assert!(matches!(err, Error::Inval(_)));
        drop(pool);
        // Closing releases the registry slot.
        let pool = Pool::open(&path, 0).unwrap();
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn size_flag_needs_create_flag() {
        let path = test_path("sizeflag");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            Pool::open(&path, O_16MB),
            Err(Error::Inval(_))
        ));
        assert!(matches!(
            Pool::open(&path, O_CF | O_16MB | O_64MB),
            Err(Error::Inval(_))
        ));
        let pool = Pool::open(&path, O_CF | O_16MB).unwrap();
        assert_eq!(pool.stats().pool_size, 16 * 1024 * 1024);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn alloc_survives_reopen() {
        let (path, pool) = fresh("allocreopen");
        let mut ctx = pool.new_ctx();
        // Publish into the superblock's root offset slot so the offset
        // itself is crash-discoverable.
        let user = pool
            .palloc(
                0,
                Some(Superblock::ROOT_OFF + 8),
                500,
                Some(&mut |data: &mut [u8]| {
                    for b in data.iter_mut().take(500) {
                        *b = 0xAA;
                    }
                    true
                }),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(user % 64, 0, "user offsets are cache-line aligned");
        drop(pool); // crash: transient state is gone, durable state stays

        let pool = Pool::open(&path, 0).unwrap();
        let published = pool.word(Superblock::ROOT_OFF + 8);
        assert_eq!(published, user);
        let data = pool.user_slice(user, 500).unwrap();
        assert!(data.iter().all(|b| *b == 0xAA));

        let hdr = unsafe {
            *pool
                .mapping()
                .at::<AllocHeader>(user - crate::alloc::layout::ALLOC_HDR_SIZE as u64)
        };
        // 500 user bytes plus the block overhead, rounded to the class.
        assert!(hdr.size as usize >= 500 + BLOCK_OVERHEAD);
        assert_eq!(hdr.size % 128, 0);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn uncommitted_context_has_no_durable_effect() {
        let (path, pool) = fresh("uncommitted");
        let free_before = pool.stats().free_chunks;
        let mut ctx = pool.new_ctx();
        ctx.add_set(Superblock::ROOT_OFF + 8, 0x1234).unwrap();
        // Crash before operation_process: the context dies with the pool.
        drop(ctx);
        drop(pool);

        let pool = Pool::open(&path, 0).unwrap();
        assert_eq!(pool.word(Superblock::ROOT_OFF + 8), 0);
        assert_eq!(pool.stats().free_chunks, free_before);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn huge_alloc_and_free_roundtrip() {
        let (path, pool) = fresh("hugeroundtrip");
        let total = pool.stats().free_chunks;
        let mut ctx = pool.new_ctx();
        let user = pool
            .palloc(0, None, CHUNK_SIZE * 2, None, &mut ctx)
            .unwrap();
        assert_eq!(pool.stats().free_chunks, total - 3);

        let mut ctx = pool.new_ctx();
        pool.palloc(user, None, 0, None, &mut ctx).unwrap();
        // Coalescing restored one contiguous free region.
        assert_eq!(pool.stats().free_chunks, total);

        let mut ctx = pool.new_ctx();
        let again = pool
            .palloc(0, None, (total as usize) * CHUNK_SIZE - BLOCK_OVERHEAD, None, &mut ctx)
            .unwrap();
        assert!(again != 0, "whole heap allocatable after coalesce");
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn out_of_space_is_enomem() {
        let (path, pool) = fresh("enomem");
        let mut ctx = pool.new_ctx();
        let err = pool
            .palloc(0, None, pool.stats().pool_size * 2, None, &mut ctx)
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOSPC);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn stats_track_inode_counter_word() {
        let (path, pool) = fresh("inodestats");
        let mut ctx = pool.new_ctx();
        ctx.add_set(Superblock::INODE_CNT_OFF, 3).unwrap();
        pool.operation_process(&mut ctx).unwrap();
        assert_eq!(pool.stats().inodes, 3);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }
}
