//! Low-level durable-store primitives (the `pmem_ops` contract): cache-line
//! flush, store drain, and persistent memcpy/memset. The heavy non-temporal
//! kernels of a production build are platform primitives; what this module
//! guarantees is the ordering contract the redo log relies on:
//!
//! * [`flush`] pushes modified cache lines toward the persistence domain but
//!   does not order them.
//! * [`drain`] is the ordering point: all flushes issued before it are
//!   durable before any store issued after it.
//! * [`persist`] is `flush` + `drain`.
//!
//! Instruction selection mirrors the pool features: `use_clflushopt`,
//! `use_clwb` and `use_ntstore` pick the newer instructions, `use_msync`
//! falls back to page-granular `msync`, and `no_persist` turns the whole
//! module into no-ops for volatile testing.

#[allow(unused_imports)]
use std::sync::atomic::{compiler_fence, Ordering};

/// Size of a cache line; the redo log aligns its dirty ranges to this.
pub const CACHELINE: usize = 64;

/// Rounds `len` bytes at `ptr` down/up to the enclosing cache-line range.
#[inline]
fn line_range(ptr: *const u8, len: usize) -> (usize, usize) {
    let start = ptr as usize & !(CACHELINE - 1);
    let end = (ptr as usize + len + CACHELINE - 1) & !(CACHELINE - 1);
    (start, end)
}

/// Flushes the cache lines covering `ptr..ptr+len`.
#[inline]
pub fn flush(ptr: *const u8, len: usize) {
    #[cfg(feature = "no_persist")]
    {
        let _ = (ptr, len);
    }

    #[cfg(all(not(feature = "no_persist"), feature = "use_msync"))]
    {
        msync(ptr, len);
    }

    #[cfg(all(
        not(feature = "no_persist"),
        not(feature = "use_msync"),
        target_arch = "x86_64"
    ))]
    {
        let (start, end) = line_range(ptr, len);
        let mut line = start;
        while line < end {
            unsafe {
                #[cfg(feature = "use_clwb")]
                std::arch::asm!("clwb [{}]", in(reg) line, options(nostack));

                #[cfg(all(not(feature = "use_clwb"), feature = "use_clflushopt"))]
                std::arch::asm!("clflushopt [{}]", in(reg) line, options(nostack));

                #[cfg(all(not(feature = "use_clwb"), not(feature = "use_clflushopt")))]
                std::arch::x86_64::_mm_clflush(line as *const u8);
            }
            line += CACHELINE;
        }
    }

    #[cfg(all(
        not(feature = "no_persist"),
        not(feature = "use_msync"),
        not(target_arch = "x86_64")
    ))]
    {
        let _ = (ptr, len);
        compiler_fence(Ordering::SeqCst);
    }
}

/// Waits for all previously flushed stores to reach the persistence domain.
#[inline]
pub fn drain() {
    #[cfg(all(not(feature = "no_persist"), target_arch = "x86_64"))]
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }

    #[cfg(all(not(feature = "no_persist"), not(target_arch = "x86_64")))]
    compiler_fence(Ordering::SeqCst);
}

/// Flushes and drains in one call; the strong form used for the final store
/// of a redo batch.
#[inline]
pub fn persist(ptr: *const u8, len: usize) {
    flush(ptr, len);
    drain();
}

/// Persists a whole object.
#[inline]
pub fn persist_obj<T: ?Sized>(x: &T) {
    persist(x as *const T as *const u8, std::mem::size_of_val(x));
}

/// Flushes a whole object without draining.
#[inline]
pub fn flush_obj<T: ?Sized>(x: &T) {
    flush(x as *const T as *const u8, std::mem::size_of_val(x));
}

/// `msync`-based flush for DAX-less filesystems. Page-aligns the range as
/// the syscall demands.
#[cfg(feature = "use_msync")]
pub fn msync(ptr: *const u8, len: usize) {
    let pagesize = 4096usize;
    let start = ptr as usize & !(pagesize - 1);
    let end = (ptr as usize + len + pagesize - 1) & !(pagesize - 1);
    unsafe {
        libc::msync(start as *mut libc::c_void, end - start, libc::MS_SYNC);
    }
}

/// Copies `len` bytes and flushes the destination; the caller drains.
#[inline]
pub fn memcpy_nodrain(dst: *mut u8, src: *const u8, len: usize) {
    unsafe {
        std::ptr::copy_nonoverlapping(src, dst, len);
    }
    flush(dst, len);
}

/// Copies `len` bytes and makes the destination durable before returning.
#[inline]
pub fn memcpy_persist(dst: *mut u8, src: *const u8, len: usize) {
    memcpy_nodrain(dst, src, len);
    drain();
}

/// Fills `len` bytes and makes the destination durable before returning.
#[inline]
pub fn memset_persist(dst: *mut u8, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(dst, val, len);
    }
    persist(dst, len);
}

/// Write-combining copy: the destination must be cache-line aligned and the
/// length a multiple of [`CACHELINE`]. Stores may still be in flight when it
/// returns; the caller must [`drain`].
pub fn memcpy_wc(dst: *mut u8, src: *const u8, len: usize) {
    debug_assert_eq!(dst as usize % CACHELINE, 0);
    debug_assert_eq!(len % CACHELINE, 0);

    #[cfg(all(
        not(feature = "no_persist"),
        feature = "use_ntstore",
        target_arch = "x86_64"
    ))]
    unsafe {
        let mut d = dst as *mut i64;
        let mut s = src as *const i64;
        let words = len / 8;
        for _ in 0..words {
            let v = std::ptr::read_unaligned(s);
            std::arch::asm!("movnti [{}], {}", in(reg) d, in(reg) v, options(nostack));
            d = d.add(1);
            s = s.add(1);
        }
    }

    #[cfg(not(all(
        not(feature = "no_persist"),
        feature = "use_ntstore",
        target_arch = "x86_64"
    )))]
    memcpy_nodrain(dst, src, len);
}

/// Write-combining fill with the same contract as [`memcpy_wc`].
pub fn memset_wc(dst: *mut u8, val: u8, len: usize) {
    debug_assert_eq!(dst as usize % CACHELINE, 0);
    debug_assert_eq!(len % CACHELINE, 0);

    unsafe {
        std::ptr::write_bytes(dst, val, len);
    }
    flush(dst, len);
}
