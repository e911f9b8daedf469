//! On-media filesystem objects: the 4 KiB inode with its payload union,
//! directory pages, and data-block extent arrays, together with the
//! constructor-based allocation helpers the filesystem consumes. Multi-word
//! object updates are staged through the operation context; variable-length
//! payloads (dirent names) are written directly while the slot is still
//! unpublished, then made live by a single word write in the redo batch.

use crate::alloc::layout::Superblock;
use crate::alloc::Pool;
use crate::ptr::{type_num, PRef, PType};
use crate::result::{Error, Result};
use crate::stm::op::OpContext;

/// Every inode, directory page and block-array page is one 4 KiB unit.
pub const INODE_SIZE: usize = 4096;

/// Bytes of the payload union inside an inode.
pub const PAYLOAD_SIZE: usize = 4000;

/// Dirent name capacity: 255 bytes plus the terminating nul.
pub const NAME_BUF: usize = 256;

/// Dirents per directory page.
pub const DIR_DENTRIES: usize = 15;

/// Extents per block-array page.
pub const BLOCK_DESCS: usize = 165;

/// File-type bits of `Inode::flags`.
pub mod inode_flags {
    pub const I_REG: u64 = 0x1;
    pub const I_DIR: u64 = 0x2;
    pub const I_SYMLINK: u64 = 0x4;
}

/// A 16-byte durable timestamp.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PTimespec {
    pub sec: i64,
    pub nsec: i64,
}

impl PTimespec {
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => PTimespec {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos() as i64,
            },
            Err(_) => PTimespec::default(),
        }
    }
}

/// One directory entry: the owning inode's pool offset and a nul-terminated
/// name. A zero `inode_off` marks the slot empty; names of dead slots are
/// garbage and never read.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Dirent {
    pub inode_off: u64,
    pub name: [u8; NAME_BUF],
}

impl Dirent {
    /// The name up to its terminating nul.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(0);
        &self.name[..end]
    }
}

/// A directory page: in-inode as the payload union's `dir` arm, or a
/// standalone allocation linked through `next`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Dir {
    pub num_elements: u64,
    pub next: PRef<Dir>,
    pub dentries: [Dirent; DIR_DENTRIES],
    _pad: [u8; 16],
}

impl Dir {
    /// Finds a live entry by name.
    pub fn find(&self, name: &[u8]) -> Option<&Dirent> {
        self.dentries
            .iter()
            .find(|d| d.inode_off != 0 && d.name_bytes() == name)
    }

    /// Index of the first empty slot.
    pub fn free_slot(&self) -> Option<usize> {
        self.dentries.iter().position(|d| d.inode_off == 0)
    }
}

/// An opaque data block; extents point at raw pool bytes.
pub struct Block;

/// One data extent.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct BlockDesc {
    pub data: PRef<Block>,
    pub size: u64,
}

/// A page of data-block extents linked through `next`; in-inode as the
/// payload union's `blocks` arm or standalone.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct BlockArray {
    pub next: PRef<BlockArray>,
    pub used: u64,
    pub blocks: [BlockDesc; BLOCK_DESCS],
    _pad: [u8; 16],
}

/// The payload arm an inode carries, selected by its flags: directory
/// entries, data extents, or raw bytes (symlink target, inline data).
#[repr(C)]
pub union InodePayload {
    pub dir: Dir,
    pub blocks: BlockArray,
    pub raw: [u8; PAYLOAD_SIZE],
}

/// The on-media inode. Exactly 4 KiB; field offsets are load-bearing
/// because metadata updates go through 8-byte redo entries.
#[repr(C)]
pub struct Inode {
    pub version: u32,
    pub uid: u32,
    pub gid: u32,
    _pad: u32,
    pub atime: PTimespec,
    pub ctime: PTimespec,
    pub mtime: PTimespec,
    pub nlink: u64,
    pub size: u64,
    pub flags: u64,
    pub last_block_fill: u64,
    pub payload: InodePayload,
}

impl Inode {
    pub const NLINK_OFF: u64 = 64;
    pub const SIZE_OFF: u64 = 72;
    pub const FLAGS_OFF: u64 = 80;
    pub const PAYLOAD_OFF: u64 = 96;

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.flags & inode_flags::I_DIR != 0
    }

    #[inline]
    pub fn is_symlink(&self) -> bool {
        self.flags & inode_flags::I_SYMLINK != 0
    }

    /// The in-inode directory page; `NotDir` otherwise.
    pub fn dir(&self) -> Result<&Dir> {
        if !self.is_dir() {
            return Err(Error::NotDir);
        }
        Ok(unsafe { &self.payload.dir })
    }

    /// The in-inode extent page; `IsDir` for directories.
    pub fn block_array(&self) -> Result<&BlockArray> {
        if self.is_dir() {
            return Err(Error::IsDir);
        }
        Ok(unsafe { &self.payload.blocks })
    }

    /// The symlink target stored in the raw payload.
    pub fn symlink_target(&self) -> Result<&[u8]> {
        if !self.is_symlink() {
            return Err(Error::Inval("not a symlink"));
        }
        let raw = unsafe { &self.payload.raw };
        let end = raw.iter().position(|b| *b == 0).unwrap_or(0);
        Ok(&raw[..end])
    }
}

impl PType for Inode {
    const TYPE_NUM: u64 = type_num::INODE;
}
impl PType for Dir {
    const TYPE_NUM: u64 = type_num::DIR;
}
impl PType for Block {
    const TYPE_NUM: u64 = type_num::BLOCK;
}
impl PType for BlockArray {
    const TYPE_NUM: u64 = type_num::BLOCK_ARRAY;
}

const _: [(); INODE_SIZE] = [(); std::mem::size_of::<Inode>()];
const _: [(); PAYLOAD_SIZE] = [(); std::mem::size_of::<Dir>()];
const _: [(); PAYLOAD_SIZE] = [(); std::mem::size_of::<BlockArray>()];
const _: [(); 264] = [(); std::mem::size_of::<Dirent>()];

// ---------------------------------------------------------------------------
// metadata views

/// File shape as reported by the stat family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

impl FileType {
    /// The `st_mode` format bits.
    pub fn mode(&self) -> u32 {
        match self {
            FileType::Regular => libc::S_IFREG,
            FileType::Directory => libc::S_IFDIR,
            FileType::Symlink => libc::S_IFLNK,
        }
    }
}

/// A stat-shaped view of one inode.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Metadata {
    pub file_type: FileType,
    pub nlink: u64,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: PTimespec,
    pub ctime: PTimespec,
    pub mtime: PTimespec,
}

impl Metadata {
    /// `lstat` semantics: a symlink inode reports `Symlink`; callers that
    /// want `stat` semantics resolve the link first and read the target.
    pub fn lstat(inode: &Inode) -> Metadata {
        let file_type = if inode.is_symlink() {
            FileType::Symlink
        } else if inode.is_dir() {
            FileType::Directory
        } else {
            FileType::Regular
        };
        Metadata {
            file_type,
            nlink: inode.nlink,
            size: inode.size,
            uid: inode.uid,
            gid: inode.gid,
            atime: inode.atime,
            ctime: inode.ctime,
            mtime: inode.mtime,
        }
    }

    /// `stat` semantics for an already-resolved inode.
    pub fn stat(inode: &Inode) -> Result<Metadata> {
        if inode.is_symlink() {
            return Err(Error::Inval("stat of an unresolved symlink"));
        }
        Ok(Metadata::lstat(inode))
    }
}

// ---------------------------------------------------------------------------
// allocation helpers

/// Allocates and initializes an inode in one atomic batch, bumping the
/// pool's inode counter in the same commit. Returns the new reference.
pub fn inode_alloc(
    pool: &Pool,
    ctx: &mut OpContext,
    flags: u64,
    uid: u32,
    gid: u32,
    dest_off: Option<u64>,
) -> Result<PRef<Inode>> {
    let cnt = ctx.resolved(Superblock::INODE_CNT_OFF);
    ctx.add_set(Superblock::INODE_CNT_OFF, cnt + 1)?;
    let now = PTimespec::now();
    let off = pool.palloc(
        0,
        dest_off,
        INODE_SIZE,
        Some(&mut |data: &mut [u8]| {
            for b in data.iter_mut() {
                *b = 0;
            }
            let inode = unsafe { &mut *(data.as_mut_ptr() as *mut Inode) };
            inode.version = 1;
            inode.uid = uid;
            inode.gid = gid;
            inode.atime = now;
            inode.ctime = now;
            inode.mtime = now;
            inode.nlink = 0;
            inode.size = 0;
            inode.flags = flags;
            inode.last_block_fill = 0;
            true
        }),
        ctx,
    )?;
    Ok(PRef::new(off))
}

/// Frees an inode and drops the pool's inode counter in the same batch.
pub fn inode_free(pool: &Pool, ctx: &mut OpContext, iref: PRef<Inode>) -> Result<()> {
    let cnt = ctx.resolved(Superblock::INODE_CNT_OFF);
    ctx.add_set(Superblock::INODE_CNT_OFF, cnt.saturating_sub(1))?;
    pool.palloc(iref.off(), None, 0, None, ctx)?;
    Ok(())
}

/// Allocates a zeroed standalone directory page.
pub fn dir_page_alloc(
    pool: &Pool,
    ctx: &mut OpContext,
    dest_off: Option<u64>,
) -> Result<PRef<Dir>> {
    let off = pool.palloc(
        0,
        dest_off,
        PAYLOAD_SIZE,
        Some(&mut |data: &mut [u8]| {
            for b in data.iter_mut() {
                *b = 0;
            }
            true
        }),
        ctx,
    )?;
    Ok(PRef::new(off))
}

/// Allocates a zeroed standalone block-array page.
pub fn block_array_alloc(
    pool: &Pool,
    ctx: &mut OpContext,
    dest_off: Option<u64>,
) -> Result<PRef<BlockArray>> {
    let off = pool.palloc(
        0,
        dest_off,
        PAYLOAD_SIZE,
        Some(&mut |data: &mut [u8]| {
            for b in data.iter_mut() {
                *b = 0;
            }
            true
        }),
        ctx,
    )?;
    Ok(PRef::new(off))
}

/// Allocates a raw data block of `size` bytes; content is left to the
/// caller (typically written and persisted before the batch commits).
pub fn block_alloc(
    pool: &Pool,
    ctx: &mut OpContext,
    size: usize,
    dest_off: Option<u64>,
) -> Result<PRef<Block>> {
    let off = pool.palloc(0, dest_off, size, None, ctx)?;
    Ok(PRef::new(off))
}

// ---------------------------------------------------------------------------
// dirent staging

/// Byte offset of `dentries[slot].inode_off` within a `Dir` at `dir_off`.
#[inline]
fn dirent_off(dir_off: u64, slot: usize) -> u64 {
    dir_off + 24 + (slot * std::mem::size_of::<Dirent>()) as u64
}

/// Stages the addition of a dirent into the directory page at `dir_off`.
///
/// The name bytes are written and persisted immediately — the slot is dead
/// until its `inode_off` word lands — and the publication (`inode_off` plus
/// the element count) rides the caller's batch, so the entry appears
/// atomically or not at all.
pub fn dir_add_entry(
    pool: &Pool,
    ctx: &mut OpContext,
    dir_off: u64,
    name: &[u8],
    inode: PRef<Inode>,
) -> Result<()> {
    super::flags::check_name(name)?;
    let dir = unsafe { &*pool.mapping().at::<Dir>(dir_off) };
    if dir.find(name).is_some() {
        return Err(Error::Exists);
    }
    // A usable slot must be dead durably AND in the pending batch: the
    // name bytes below are written in place, which is only safe while no
    // committed state can still resurrect the slot (an aborted rename must
    // leave the old entry byte-for-byte intact).
    let slot = (0..DIR_DENTRIES)
        .find(|i| {
            dir.dentries[*i].inode_off == 0
                && ctx.resolved(dirent_off(dir_off, *i)) == 0
        })
        .ok_or(Error::NoSpace)?;

    let name_off = dirent_off(dir_off, slot) + 8;
    let buf = pool.user_slice_mut(name_off, NAME_BUF)?;
    buf[..name.len()].copy_from_slice(name);
    buf[name.len()..].iter_mut().for_each(|b| *b = 0);
    crate::ll::persist(buf.as_ptr(), NAME_BUF);

    ctx.add_set(dirent_off(dir_off, slot), inode.off())?;
    let n = ctx.resolved(dir_off);
    ctx.add_set(dir_off, n + 1)
}

/// Stages the removal of a dirent; returns the unlinked inode's offset.
pub fn dir_remove_entry(
    pool: &Pool,
    ctx: &mut OpContext,
    dir_off: u64,
    name: &[u8],
) -> Result<u64> {
    super::flags::check_name(name)?;
    let dir = unsafe { &*pool.mapping().at::<Dir>(dir_off) };
    let slot = dir
        .dentries
        .iter()
        .position(|d| d.inode_off != 0 && d.name_bytes() == name)
        .ok_or(Error::NotFound)?;
    let inode_off = dir.dentries[slot].inode_off;
    ctx.add_set(dirent_off(dir_off, slot), 0)?;
    let n = ctx.resolved(dir_off);
    ctx.add_set(dir_off, n - 1)?;
    Ok(inode_off)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alloc::pool::open_flags::O_CF;

    fn fresh(name: &str) -> (std::path::PathBuf, Pool) {
        let mut path = std::env::temp_dir();
        path.push(format!("pmemheap-fs-{}-{}.pool", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let pool = Pool::open(&path, O_CF).unwrap();
        (path, pool)
    }

    #[test]
    fn inode_field_offsets_match_redo_targets() {
        let i = std::mem::MaybeUninit::<Inode>::uninit();
        let base = i.as_ptr() as usize;
        unsafe {
            assert_eq!(
                std::ptr::addr_of!((*i.as_ptr()).nlink) as usize - base,
                Inode::NLINK_OFF as usize
            );
            assert_eq!(
                std::ptr::addr_of!((*i.as_ptr()).size) as usize - base,
                Inode::SIZE_OFF as usize
            );
            assert_eq!(
                std::ptr::addr_of!((*i.as_ptr()).flags) as usize - base,
                Inode::FLAGS_OFF as usize
            );
            assert_eq!(
                std::ptr::addr_of!((*i.as_ptr()).payload) as usize - base,
                Inode::PAYLOAD_OFF as usize
            );
        }
    }

    #[test]
    fn alloc_inode_and_reopen() {
        let (path, pool) = fresh("inodealloc");
        let mut ctx = pool.new_ctx();
        let iref = inode_alloc(&pool, &mut ctx, inode_flags::I_DIR, 17, 42, None).unwrap();
        let mut ctx2 = pool.new_ctx();
        pool.set_root(iref, &mut ctx2).unwrap();
        pool.operation_process(&mut ctx2).unwrap();
        drop(pool);

        let pool = Pool::open(&path, 0).unwrap();
        let root = pool.root();
        assert_eq!(root, iref);
        let inode = pool.deref(root).unwrap();
        assert!(inode.is_dir());
        assert!(!inode.is_symlink());
        assert_eq!(inode.uid, 17);
        assert_eq!(inode.gid, 42);
        assert_eq!(inode.nlink, 0);
        assert_eq!(inode.dir().unwrap().num_elements, 0);
        assert_eq!(pool.stats().inodes, 1);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn inode_free_decrements_counter() {
        let (path, pool) = fresh("inodefree");
        let mut ctx = pool.new_ctx();
        let iref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();
        assert_eq!(pool.stats().inodes, 1);
        let mut ctx = pool.new_ctx();
        inode_free(&pool, &mut ctx, iref).unwrap();
        assert_eq!(pool.stats().inodes, 0);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn dirent_add_find_remove() {
        let (path, pool) = fresh("dirent");
        let mut ctx = pool.new_ctx();
        let dref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_DIR, 0, 0, None).unwrap();
        let mut ctx = pool.new_ctx();
        let fref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();

        let dir_off = dref.off() + Inode::PAYLOAD_OFF;
        let mut ctx = pool.new_ctx();
        dir_add_entry(&pool, &mut ctx, dir_off, b"alpha", fref).unwrap();
        pool.operation_process(&mut ctx).unwrap();

        let dir = pool.deref(dref).unwrap().dir().unwrap();
        assert_eq!(dir.num_elements, 1);
        let ent = dir.find(b"alpha").unwrap();
        assert_eq!(ent.inode_off, fref.off());
        assert!(dir.find(b"beta").is_none());

        // Duplicate names refuse before anything is staged.
        let mut ctx = pool.new_ctx();
        assert!(matches!(
            dir_add_entry(&pool, &mut ctx, dir_off, b"alpha", fref),
            Err(Error::Exists)
        ));

        let mut ctx = pool.new_ctx();
        let gone = dir_remove_entry(&pool, &mut ctx, dir_off, b"alpha").unwrap();
        pool.operation_process(&mut ctx).unwrap();
        assert_eq!(gone, fref.off());
        let dir = pool.deref(dref).unwrap().dir().unwrap();
        assert_eq!(dir.num_elements, 0);
        assert!(dir.find(b"alpha").is_none());

        let mut ctx = pool.new_ctx();
        assert!(matches!(
            dir_remove_entry(&pool, &mut ctx, dir_off, b"alpha"),
            Err(Error::NotFound)
        ));
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn staged_dirent_is_invisible_until_commit() {
        let (path, pool) = fresh("direntstaged");
        let mut ctx = pool.new_ctx();
        let dref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_DIR, 0, 0, None).unwrap();
        let mut ctx = pool.new_ctx();
        let fref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();

        let dir_off = dref.off() + Inode::PAYLOAD_OFF;
        let mut ctx = pool.new_ctx();
        dir_add_entry(&pool, &mut ctx, dir_off, b"ghost", fref).unwrap();
        // Abandoned before commit: the name bytes landed but the slot's
        // inode word never did, so the entry does not exist.
        drop(ctx);
        let dir = pool.deref(dref).unwrap().dir().unwrap();
        assert_eq!(dir.num_elements, 0);
        assert!(dir.find(b"ghost").is_none());
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rename_within_directory_is_atomic() {
        use crate::stm::tx::Transaction;

        let (path, pool) = fresh("rename");
        let mut ctx = pool.new_ctx();
        let dref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_DIR, 0, 0, None).unwrap();
        let mut ctx = pool.new_ctx();
        let fref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();
        let dir_off = dref.off() + Inode::PAYLOAD_OFF;
        let mut ctx = pool.new_ctx();
        dir_add_entry(&pool, &mut ctx, dir_off, b"x", fref).unwrap();
        pool.operation_process(&mut ctx).unwrap();

        // Abort between the two halves: only "x" survives.
        {
            let mut tx = Transaction::new(&pool);
            let gone =
                dir_remove_entry(&pool, tx.ctx(), dir_off, b"x").unwrap();
            assert_eq!(gone, fref.off());
            dir_add_entry(&pool, tx.ctx(), dir_off, b"y", fref).unwrap();
        }
        let dir = pool.deref(dref).unwrap().dir().unwrap();
        assert!(dir.find(b"x").is_some());
        assert!(dir.find(b"y").is_none());
        assert_eq!(dir.num_elements, 1);

        // Committed: only "y" survives, same inode behind it.
        let mut tx = Transaction::new(&pool);
        dir_remove_entry(&pool, tx.ctx(), dir_off, b"x").unwrap();
        dir_add_entry(&pool, tx.ctx(), dir_off, b"y", fref).unwrap();
        tx.commit().unwrap();
        let dir = pool.deref(dref).unwrap().dir().unwrap();
        assert!(dir.find(b"x").is_none());
        assert_eq!(dir.find(b"y").unwrap().inode_off, fref.off());
        assert_eq!(dir.num_elements, 1);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn lstat_reports_symlink_stat_refuses() {
        let (path, pool) = fresh("lstat");
        let mut ctx = pool.new_ctx();
        let sref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_SYMLINK, 0, 0, None).unwrap();
        let inode = pool.deref(sref).unwrap();
        let meta = Metadata::lstat(inode);
        assert_eq!(meta.file_type, FileType::Symlink);
        assert_eq!(meta.file_type.mode(), libc::S_IFLNK);
        assert!(Metadata::stat(inode).is_err());

        let mut ctx = pool.new_ctx();
        let rref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();
        let inode = pool.deref(rref).unwrap();
        assert_eq!(Metadata::stat(inode).unwrap().file_type, FileType::Regular);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn payload_arms_are_guarded() {
        let (path, pool) = fresh("payload");
        let mut ctx = pool.new_ctx();
        let dref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_DIR, 0, 0, None).unwrap();
        let inode = pool.deref(dref).unwrap();
        assert!(inode.dir().is_ok());
        assert!(matches!(inode.block_array(), Err(Error::IsDir)));

        let mut ctx = pool.new_ctx();
        let fref =
            inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();
        let inode = pool.deref(fref).unwrap();
        assert!(matches!(inode.dir(), Err(Error::NotDir)));
        assert!(inode.block_array().is_ok());
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }
}
