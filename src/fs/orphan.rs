//! The orphaned-inode list: inodes whose link count reached zero while
//! handles were still open, parked until the last close. The list is a
//! doubly-linked chain of page-sized `InodeArray` segments, each guarded by
//! its own persistent mutex. Pages are appended when the tail fills and are
//! never reclaimed; the list keeps its high-water mark.

use crate::alloc::layout::Superblock;
use crate::alloc::Pool;
use crate::ptr::{type_num, PRef, PType};
use crate::result::{Error, Result};
use crate::stm::tx::Transaction;
use crate::sync::PMutex;

use super::inode::{Inode, INODE_SIZE};

/// Inode slots per list segment.
pub const INODE_ARRAY_SLOTS: usize = 249;

/// One segment of the orphan list. Page-sized; the mutex serializes slot
/// updates within the segment, and like every persistent mutex it is
/// re-armed at pool open.
#[repr(C)]
pub struct InodeArray {
    pub mutex: PMutex,
    pub prev: PRef<InodeArray>,
    pub next: PRef<InodeArray>,
    pub used: u64,
    pub inodes: [PRef<Inode>; INODE_ARRAY_SLOTS],
    _pad: [u8; 8],
}

impl InodeArray {
    pub const PREV_OFF: u64 = 64;
    pub const NEXT_OFF: u64 = 80;
    pub const USED_OFF: u64 = 96;
    pub const INODES_OFF: u64 = 104;
}

impl PType for InodeArray {
    const TYPE_NUM: u64 = type_num::INODE_ARRAY;
}

const _: [(); INODE_SIZE] = [(); std::mem::size_of::<InodeArray>()];

/// Where an orphaned inode is parked; kept by its vinode so the last close
/// can clear exactly this slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OrphanSlot {
    pub page: PRef<InodeArray>,
    pub slot: usize,
}

#[inline]
fn slot_off(page: PRef<InodeArray>, slot: usize) -> u64 {
    page.off() + InodeArray::INODES_OFF + (slot * 16) as u64
}

/// Parks `inode` on the orphan list. The chosen segment's mutex stays held
/// (via the transaction) until the caller commits, and the slot write rides
/// the caller's batch. Grows the list by one segment when every page is
/// full.
pub fn orphan_insert<'p>(
    pool: &'p Pool,
    tx: &mut Transaction<'p>,
    inode: PRef<Inode>,
) -> Result<OrphanSlot> {
    let mut cur = orphans_head(pool);
    while !cur.is_null() {
        let arr = pool.deref(cur)?;
        let guard = arr.mutex.lock();
        let used = tx.ctx().resolved(cur.off() + InodeArray::USED_OFF);
        if used < INODE_ARRAY_SLOTS as u64 {
            let slot = (0..INODE_ARRAY_SLOTS)
                .find(|i| tx.ctx().resolved(slot_off(cur, *i) + 8) == 0)
                .ok_or(Error::Corruption("orphan page used counter drifted"))?;
            tx.ctx().add_set(slot_off(cur, slot), type_num::INODE)?;
            tx.ctx().add_set(slot_off(cur, slot) + 8, inode.off())?;
            tx.ctx().add_set(cur.off() + InodeArray::USED_OFF, used + 1)?;
            tx.defer_unlock(guard);
            return Ok(OrphanSlot { page: cur, slot });
        }
        drop(guard);
        cur = arr.next;
    }

    // Every segment is full (or none exists): append one at the head. The
    // new page becomes durable and head-linked in its own batch — an empty
    // segment commutes with everything — while the back link of the old
    // head rides the caller's batch; pool open repairs it if we crash in
    // between.
    let old_head = orphans_head(pool);
    tx.ctx()
        .add_set(Superblock::ORPHANS_OFF, type_num::INODE_ARRAY)?;
    let page_off = pool.palloc(
        0,
        Some(Superblock::ORPHANS_OFF + 8),
        INODE_SIZE,
        Some(&mut |data: &mut [u8]| {
            for b in data.iter_mut() {
                *b = 0;
            }
            let arr = unsafe { &mut *(data.as_mut_ptr() as *mut InodeArray) };
            arr.mutex.init();
            arr.prev = PRef::null();
            arr.next = old_head;
            arr.used = 0;
            true
        }),
        tx.ctx(),
    )?;
    let page = PRef::<InodeArray>::new(page_off);
    if !old_head.is_null() {
        tx.ctx()
            .add_set(old_head.off() + InodeArray::PREV_OFF, type_num::INODE_ARRAY)?;
        tx.ctx()
            .add_set(old_head.off() + InodeArray::PREV_OFF + 8, page_off)?;
    }

    let guard = pool.deref(page)?.mutex.lock();
    tx.ctx().add_set(slot_off(page, 0), type_num::INODE)?;
    tx.ctx().add_set(slot_off(page, 0) + 8, inode.off())?;
    tx.ctx().add_set(page.off() + InodeArray::USED_OFF, 1)?;
    tx.defer_unlock(guard);
    Ok(OrphanSlot { page, slot: 0 })
}

/// Unparks the inode at `slot`; runs on last close. The segment stays
/// allocated.
pub fn orphan_remove<'p>(
    pool: &'p Pool,
    tx: &mut Transaction<'p>,
    slot: &OrphanSlot,
) -> Result<()> {
    let arr = pool.deref(slot.page)?;
    let guard = arr.mutex.lock();
    let off = slot_off(slot.page, slot.slot);
    if tx.ctx().resolved(off + 8) == 0 {
        return Err(Error::Corruption("orphan slot already empty"));
    }
    tx.ctx().add_set(off, 0)?;
    tx.ctx().add_set(off + 8, 0)?;
    let used = tx.ctx().resolved(slot.page.off() + InodeArray::USED_OFF);
    tx.ctx()
        .add_set(slot.page.off() + InodeArray::USED_OFF, used - 1)?;
    tx.defer_unlock(guard);
    Ok(())
}

/// All parked inode offsets, in list order; test and fsck aid.
pub fn orphan_list(pool: &Pool) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    let mut cur = orphans_head(pool);
    while !cur.is_null() {
        let arr = pool.deref(cur)?;
        let _guard = arr.mutex.lock();
        for r in arr.inodes.iter() {
            if !r.is_null() {
                out.push(r.off());
            }
        }
        cur = arr.next;
    }
    Ok(out)
}

fn orphans_head(pool: &Pool) -> PRef<InodeArray> {
    unsafe { &*pool.mapping().at::<Superblock>(0) }.orphaned_inodes
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alloc::pool::open_flags::O_CF;

    fn fresh(name: &str) -> (std::path::PathBuf, Pool) {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "pmemheap-orphan-{}-{}.pool",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let pool = Pool::open(&path, O_CF).unwrap();
        (path, pool)
    }

    fn fake_inode(n: u64) -> PRef<Inode> {
        PRef::new(0x10000 + n * 64)
    }

    #[test]
    fn insert_remove_roundtrip() {
        let (path, pool) = fresh("roundtrip");
        let mut tx = Transaction::new(&pool);
        let a = orphan_insert(&pool, &mut tx, fake_inode(1)).unwrap();
        let b = orphan_insert(&pool, &mut tx, fake_inode(2)).unwrap();
        tx.commit().unwrap();
        assert_eq!(a.page, b.page);
        assert_ne!(a.slot, b.slot);
        assert_eq!(
            orphan_list(&pool).unwrap(),
            vec![fake_inode(1).off(), fake_inode(2).off()]
        );

        let mut tx = Transaction::new(&pool);
        orphan_remove(&pool, &mut tx, &a).unwrap();
        tx.commit().unwrap();
        assert_eq!(orphan_list(&pool).unwrap(), vec![fake_inode(2).off()]);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn aborted_insert_leaves_list_unchanged() {
        let (path, pool) = fresh("aborted");
        let mut tx = Transaction::new(&pool);
        orphan_insert(&pool, &mut tx, fake_inode(7)).unwrap();
        drop(tx); // abort
        // The first insert allocates the head segment durably (an empty
        // page is harmless) but no slot may be occupied.
        assert_eq!(orphan_list(&pool).unwrap(), Vec::<u64>::new());
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn list_survives_reopen() {
        let (path, pool) = fresh("reopen");
        let mut tx = Transaction::new(&pool);
        let slot = orphan_insert(&pool, &mut tx, fake_inode(3)).unwrap();
        tx.commit().unwrap();
        drop(pool);

        let pool = Pool::open(&path, 0).unwrap();
        assert_eq!(orphan_list(&pool).unwrap(), vec![fake_inode(3).off()]);
        let mut tx = Transaction::new(&pool);
        orphan_remove(&pool, &mut tx, &slot).unwrap();
        tx.commit().unwrap();
        assert_eq!(orphan_list(&pool).unwrap(), Vec::<u64>::new());
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn grows_a_second_segment_when_full() {
        let (path, pool) = fresh("grow");
        let mut first_page = None;
        for n in 0..(INODE_ARRAY_SLOTS as u64 + 1) {
            let mut tx = Transaction::new(&pool);
            let slot = orphan_insert(&pool, &mut tx, fake_inode(n)).unwrap();
            tx.commit().unwrap();
            match first_page {
                None => first_page = Some(slot.page),
                Some(p) if n < INODE_ARRAY_SLOTS as u64 => assert_eq!(slot.page, p),
                Some(p) => {
                    // Slot 250 landed on a fresh segment linked at the head.
                    assert_ne!(slot.page, p);
                    assert_eq!(orphans_head(&pool), slot.page);
                    let new = pool.deref(slot.page).unwrap();
                    assert_eq!(new.next, p);
                    let old = pool.deref(p).unwrap();
                    assert_eq!(old.prev, slot.page);
                }
            }
        }
        assert_eq!(orphan_list(&pool).unwrap().len(), INODE_ARRAY_SLOTS + 1);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn double_remove_is_corruption() {
        let (path, pool) = fresh("doubleremove");
        let mut tx = Transaction::new(&pool);
        let slot = orphan_insert(&pool, &mut tx, fake_inode(9)).unwrap();
        tx.commit().unwrap();
        let mut tx = Transaction::new(&pool);
        orphan_remove(&pool, &mut tx, &slot).unwrap();
        tx.commit().unwrap();
        let mut tx = Transaction::new(&pool);
        assert!(matches!(
            orphan_remove(&pool, &mut tx, &slot),
            Err(Error::Corruption(_))
        ));
        drop(tx);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }
}
