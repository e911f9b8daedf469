//! *pmemheap* is a crash-consistent allocator and update protocol for
//! byte-addressable persistent memory, together with the durable object
//! substrate a POSIX-style filesystem builds on. A pool is a memory-mapped
//! file; every durable reference inside it is a pool-relative offset, so
//! the pool may be remapped at a different virtual base on every open.
//!
//! # Crash consistency model
//!
//! All durable mutation funnels through two mechanisms:
//!
//! * The [redo log](stm::redo) commits a bounded batch of 8-byte word
//!   writes atomically: after a crash the batch is observed either in full
//!   or not at all, and a torn log is detected by checksum and scrubbed.
//! * The [operation context](stm::op) accumulates the word writes of one
//!   logical transaction (`SET`, and `AND`/`OR` resolved at append time)
//!   and hands them to the redo log in one batch.
//!
//! The [allocator](alloc::palloc) builds `malloc`/`free`/`realloc` on top
//! as a single operation: reservation and constructor run with no durable
//! footprint, the metadata flip, the optional publish of the new offset
//! and the old block's release commit in one batch, and only transient
//! bucket state is touched afterwards. The heap itself is
//! [zones of chunks](alloc::layout); whole-chunk allocations coalesce with
//! their free neighbours, and sub-chunk sizes come from bitmap-tracked
//! runs, served best-fit by a volatile bucket index rebuilt at every open.
//!
//! # Filesystem substrate
//!
//! The [`fs`] module holds what a filesystem consumes from the core:
//! page-exact [inode, directory and extent objects](fs::inode), the
//! [orphaned-inode list](fs::orphan) for unlinked-but-open inodes,
//! [reference-counted volatile handles](fs::vinode), open-flag and name
//! validation ([`fs::flags`]), and the scoped [transaction](stm::tx) whose
//! abort queue unwinds transient effects in LIFO order.
//!
//! # Example
//!
//! ```no_run
//! use pmemheap::alloc::pool::open_flags::O_CF;
//! use pmemheap::alloc::Pool;
//!
//! fn main() -> pmemheap::result::Result<()> {
//!     let pool = Pool::open("foo.pool", O_CF)?;
//!
//!     let mut ctx = pool.new_ctx();
//!     let off = pool.palloc(
//!         0,
//!         None,
//!         500,
//!         Some(&mut |data: &mut [u8]| {
//!             for b in data.iter_mut() {
//!                 *b = 0xAA;
//!             }
//!             true
//!         }),
//!         &mut ctx,
//!     )?;
//!
//!     assert_eq!(pool.user_slice(off, 500)?[499], 0xAA);
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate lazy_static;

pub mod alloc;
pub mod fs;
pub mod ll;
pub mod ptr;
pub mod result;
pub mod stm;
pub mod sync;

pub use alloc::pool::{open_flags, DEFAULT_POOL_SIZE};
pub use alloc::{Pool, PoolStats};
pub use ptr::PRef;
pub use stm::{OpContext, Transaction};
