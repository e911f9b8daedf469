//! Volatile inode handles. A [`Vinode`] is the in-memory face of one
//! persistent inode: reference-counted through the pool's [`VinodeSet`],
//! carrying the reader/writer lock taken around directory mutation and
//! truncation, a debug path, and — for unlinked-but-open inodes — the
//! orphan-list slot the inode is parked on. The set guarantees one handle
//! per inode offset, so handle identity is inode identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use crate::alloc::Pool;
use crate::ptr::PRef;
use crate::result::{Error, Result};
use crate::stm::tx::Transaction;

use super::inode::{inode_free, Inode, Metadata};
use super::orphan::{orphan_remove, OrphanSlot};

/// A reference-counted volatile handle to a persistent inode.
pub struct Vinode {
    iref: PRef<Inode>,
    /// Taken for writing around directory mutation and truncation; for
    /// rename the two handles' locks are acquired in address order.
    pub rwlock: RwLock<()>,
    dbg_path: Mutex<String>,
    orphan: Mutex<Option<OrphanSlot>>,
}

impl Vinode {
    fn new(iref: PRef<Inode>) -> Self {
        Vinode {
            iref,
            rwlock: RwLock::new(()),
            dbg_path: Mutex::new(String::new()),
            orphan: Mutex::new(None),
        }
    }

    #[inline]
    pub fn iref(&self) -> PRef<Inode> {
        self.iref
    }

    /// The live inode behind this handle.
    pub fn inode<'p>(&self, pool: &'p Pool) -> Result<&'p Inode> {
        pool.deref(self.iref)
    }

    pub fn is_symlink(&self, pool: &Pool) -> Result<bool> {
        Ok(self.inode(pool)?.is_symlink())
    }

    /// `lstat` of this handle: symlinks report themselves.
    pub fn lstat(&self, pool: &Pool) -> Result<Metadata> {
        Ok(Metadata::lstat(self.inode(pool)?))
    }

    /// `stat` of this handle; the caller resolves symlinks first.
    pub fn stat(&self, pool: &Pool) -> Result<Metadata> {
        Metadata::stat(self.inode(pool)?)
    }

    /// The path this handle was resolved through, for diagnostics only.
    pub fn dbg_path(&self) -> String {
        self.dbg_path.lock().unwrap().clone()
    }

    pub fn set_dbg_path(&self, path: &str) {
        *self.dbg_path.lock().unwrap() = path.to_string();
    }

    /// Records where the (now unlinked) inode is parked.
    pub fn set_orphan(&self, slot: OrphanSlot) {
        *self.orphan.lock().unwrap() = Some(slot);
    }

    pub fn take_orphan(&self) -> Option<OrphanSlot> {
        self.orphan.lock().unwrap().take()
    }
}

/// Write-locks two handles in address order, deduplicating when they are
/// the same handle; the rename lock discipline.
pub fn write_lock_pair<'a>(
    a: &'a Vinode,
    b: &'a Vinode,
) -> (RwLockWriteGuard<'a, ()>, Option<RwLockWriteGuard<'a, ()>>) {
    let pa = a as *const Vinode as usize;
    let pb = b as *const Vinode as usize;
    if pa == pb {
        (a.rwlock.write().unwrap(), None)
    } else if pa < pb {
        let ga = a.rwlock.write().unwrap();
        let gb = b.rwlock.write().unwrap();
        (ga, Some(gb))
    } else {
        let gb = b.rwlock.write().unwrap();
        let ga = a.rwlock.write().unwrap();
        (ga, Some(gb))
    }
}

/// The pool's registry of live handles: at most one [`Vinode`] per inode,
/// with an explicit handle count driving the orphan-list lifecycle.
pub struct VinodeSet {
    map: Mutex<HashMap<u64, (Arc<Vinode>, u32)>>,
}

impl VinodeSet {
    pub fn new() -> Self {
        VinodeSet {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the handle for `iref`, creating it with one reference or
    /// bumping the count of the existing one.
    pub fn get(&self, iref: PRef<Inode>) -> Arc<Vinode> {
        let mut map = self.map.lock().unwrap();
        let entry = map
            .entry(iref.off())
            .or_insert_with(|| (Arc::new(Vinode::new(iref)), 0));
        entry.1 += 1;
        Arc::clone(&entry.0)
    }

    /// Open-handle count for an inode offset; zero when no handle exists.
    pub fn ref_count(&self, off: u64) -> u32 {
        self.map.lock().unwrap().get(&off).map(|e| e.1).unwrap_or(0)
    }

    /// Releases one reference. On the last release of an inode whose link
    /// count is zero, the inode leaves the orphan list and is freed, all in
    /// the caller's batch. Every exit path of a collaborator must come
    /// through here exactly once per `get`.
    pub fn unref<'p>(
        &self,
        pool: &'p Pool,
        tx: &mut Transaction<'p>,
        vinode: &Arc<Vinode>,
    ) -> Result<()> {
        let last = {
            let mut map = self.map.lock().unwrap();
            let entry = map
                .get_mut(&vinode.iref().off())
                .ok_or(Error::Corruption("unref of an unregistered vinode"))?;
            entry.1 -= 1;
            if entry.1 == 0 {
                map.remove(&vinode.iref().off());
                true
            } else {
                false
            }
        };
        if last && vinode.inode(pool)?.nlink == 0 {
            if let Some(slot) = vinode.take_orphan() {
                orphan_remove(pool, tx, &slot)?;
            }
            inode_free(pool, tx.ctx(), vinode.iref())?;
        }
        Ok(())
    }
}

impl Pool {
    /// Shorthand for [`VinodeSet::get`] on this pool's registry.
    pub fn vinode_get(&self, iref: PRef<Inode>) -> Arc<Vinode> {
        self.vinodes.get(iref)
    }

    /// Shorthand for [`VinodeSet::unref`] on this pool's registry.
    pub fn vinode_unref<'p>(
        &'p self,
        tx: &mut Transaction<'p>,
        vinode: &Arc<Vinode>,
    ) -> Result<()> {
        self.vinodes.unref(self, tx, vinode)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alloc::pool::open_flags::O_CF;
    use crate::fs::inode::{inode_alloc, inode_flags, Inode};
    use crate::fs::orphan::{orphan_insert, orphan_list};

    fn fresh(name: &str) -> (std::path::PathBuf, Pool) {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "pmemheap-vinode-{}-{}.pool",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let pool = Pool::open(&path, O_CF).unwrap();
        (path, pool)
    }

    #[test]
    fn one_handle_per_inode() {
        let (path, pool) = fresh("identity");
        let mut ctx = pool.new_ctx();
        let iref = inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();

        let a = pool.vinode_get(iref);
        let b = pool.vinode_get(iref);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.vinodes.ref_count(iref.off()), 2);

        a.set_dbg_path("/somewhere/f");
        assert_eq!(b.dbg_path(), "/somewhere/f");
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn unref_keeps_linked_inode() {
        let (path, pool) = fresh("linked");
        let mut ctx = pool.new_ctx();
        let iref = inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();
        // Pretend a dirent links it.
        let mut ctx = pool.new_ctx();
        ctx.add_set(iref.off() + Inode::NLINK_OFF, 1).unwrap();
        pool.operation_process(&mut ctx).unwrap();

        let v = pool.vinode_get(iref);
        let mut tx = Transaction::new(&pool);
        pool.vinode_unref(&mut tx, &v).unwrap();
        tx.commit().unwrap();
        assert_eq!(pool.stats().inodes, 1, "linked inode survives last close");
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn orphan_lifecycle_frees_inode_on_last_close() {
        let (path, pool) = fresh("orphanfree");
        let mut ctx = pool.new_ctx();
        let iref = inode_alloc(&pool, &mut ctx, inode_flags::I_REG, 0, 0, None).unwrap();
        assert_eq!(pool.stats().inodes, 1);

        // Unlink with two open handles: park on the orphan list.
        let v1 = pool.vinode_get(iref);
        let v2 = pool.vinode_get(iref);
        let mut tx = Transaction::new(&pool);
        let slot = orphan_insert(&pool, &mut tx, iref).unwrap();
        v1.set_orphan(slot);
        tx.commit().unwrap();
        assert_eq!(orphan_list(&pool).unwrap(), vec![iref.off()]);

        // First close: still open somewhere, inode stays parked.
        let mut tx = Transaction::new(&pool);
        pool.vinode_unref(&mut tx, &v2).unwrap();
        tx.commit().unwrap();
        assert_eq!(orphan_list(&pool).unwrap(), vec![iref.off()]);
        assert_eq!(pool.stats().inodes, 1);

        // Last close: unparked and freed in one batch.
        let mut tx = Transaction::new(&pool);
        pool.vinode_unref(&mut tx, &v1).unwrap();
        tx.commit().unwrap();
        assert_eq!(orphan_list(&pool).unwrap(), Vec::<u64>::new());
        assert_eq!(pool.stats().inodes, 0);
        assert_eq!(pool.vinodes.ref_count(iref.off()), 0);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn lock_pair_orders_and_dedups() {
        let (path, pool) = fresh("lockpair");
        let mut ctx = pool.new_ctx();
        let a = inode_alloc(&pool, &mut ctx, inode_flags::I_DIR, 0, 0, None).unwrap();
        let mut ctx = pool.new_ctx();
        let b = inode_alloc(&pool, &mut ctx, inode_flags::I_DIR, 0, 0, None).unwrap();

        let va = pool.vinode_get(a);
        let vb = pool.vinode_get(b);
        {
            let (_ga, gb) = write_lock_pair(&va, &vb);
            assert!(gb.is_some());
        }
        {
            let (_ga, gb) = write_lock_pair(&va, &va);
            assert!(gb.is_none(), "same handle locks once");
        }
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }
}
