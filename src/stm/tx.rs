//! Scoped transactions for filesystem collaborators. A [`Transaction`]
//! owns the operation context for one syscall-equivalent and a LIFO queue
//! of abort actions that reverse transient effects (reference counts,
//! speculative registry entries). Dropping the transaction without
//! committing runs the queue and discards the context, so no redo record
//! from an aborted transaction is ever applied.

use crate::alloc::Pool;
use crate::result::Result;
use crate::stm::op::OpContext;
use crate::sync::PMutexGuard;

/// A scoped transaction over one pool.
pub struct Transaction<'p> {
    pool: &'p Pool,
    ctx: OpContext,
    abort: Vec<Box<dyn FnOnce() + 'p>>,
    locks: Vec<PMutexGuard<'p>>,
    committed: bool,
}

impl<'p> Transaction<'p> {
    pub fn new(pool: &'p Pool) -> Self {
        Transaction {
            pool,
            ctx: pool.new_ctx(),
            abort: Vec::new(),
            locks: Vec::new(),
            committed: false,
        }
    }

    /// The pool this transaction runs against.
    #[inline]
    pub fn pool(&self) -> &'p Pool {
        self.pool
    }

    /// The operation context accumulating this transaction's word writes.
    #[inline]
    pub fn ctx(&mut self) -> &mut OpContext {
        &mut self.ctx
    }

    /// Registers an action to run, in LIFO order, if the transaction
    /// aborts.
    pub fn on_abort<F: FnOnce() + 'p>(&mut self, f: F) {
        self.abort.push(Box::new(f));
    }

    /// Keeps a persistent-mutex guard alive until the transaction ends, so
    /// staged updates to the locked object stay private until commit.
    pub fn defer_unlock(&mut self, guard: PMutexGuard<'p>) {
        self.locks.push(guard);
    }

    /// Commits the accumulated context through the pool's redo log. On
    /// error the transaction aborts as if dropped.
    pub fn commit(mut self) -> Result<()> {
        self.pool.operation_process(&mut self.ctx)?;
        self.committed = true;
        self.abort.clear();
        Ok(())
    }
}

impl<'p> Drop for Transaction<'p> {
    fn drop(&mut self) {
        if !self.committed {
            self.ctx.clear();
            while let Some(f) = self.abort.pop() {
                f();
            }
        }
        self.locks.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alloc::layout::Superblock;
    use crate::alloc::pool::open_flags::O_CF;
    use std::cell::RefCell;

    fn fresh(name: &str) -> (std::path::PathBuf, Pool) {
        let mut path = std::env::temp_dir();
        path.push(format!("pmemheap-tx-{}-{}.pool", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let pool = Pool::open(&path, O_CF).unwrap();
        (path, pool)
    }

    #[test]
    fn commit_applies_context() {
        let (path, pool) = fresh("commit");
        let mut tx = Transaction::new(&pool);
        tx.ctx().add_set(Superblock::INODE_CNT_OFF, 5).unwrap();
        tx.commit().unwrap();
        assert_eq!(pool.word(Superblock::INODE_CNT_OFF), 5);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn drop_without_commit_applies_nothing() {
        let (path, pool) = fresh("droppedtx");
        {
            let mut tx = Transaction::new(&pool);
            tx.ctx().add_set(Superblock::INODE_CNT_OFF, 9).unwrap();
        }
        assert_eq!(pool.word(Superblock::INODE_CNT_OFF), 0);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn abort_queue_runs_in_lifo_order() {
        let (path, pool) = fresh("abortorder");
        let order = RefCell::new(Vec::new());
        {
            let mut tx = Transaction::new(&pool);
            tx.on_abort(|| order.borrow_mut().push(1));
            tx.on_abort(|| order.borrow_mut().push(2));
            tx.on_abort(|| order.borrow_mut().push(3));
        }
        assert_eq!(*order.borrow(), vec![3, 2, 1]);
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn abort_queue_skipped_on_commit() {
        let (path, pool) = fresh("abortskip");
        let ran = RefCell::new(false);
        {
            let mut tx = Transaction::new(&pool);
            tx.on_abort(|| *ran.borrow_mut() = true);
            tx.commit().unwrap();
        }
        assert!(!*ran.borrow());
        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }
}
