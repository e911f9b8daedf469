//! Persistent-memory-hosted locks. A [`PMutex`] lives inside the pool image
//! (run headers, orphan-list pages) but its locked state is meaningful only
//! within one process lifetime: pool open re-arms every persistent mutex, so
//! a crash while holding one can never wedge the next boot.

use std::cell::UnsafeCell;

const PMUTEX_SIZE: usize = 64;

/// A pthread mutex embedded in persistent memory, padded to one cache line
/// so neighbouring fields never share its line.
#[repr(C)]
pub struct PMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
    _pad: [u8; PMUTEX_SIZE - std::mem::size_of::<libc::pthread_mutex_t>()],
}

unsafe impl Send for PMutex {}
unsafe impl Sync for PMutex {}

impl PMutex {
    /// Re-arms the mutex to the unlocked state. Called when the object is
    /// constructed and again for every persistent mutex during pool open.
    pub fn init(&self) {
        unsafe {
            std::ptr::write(self.inner.get(), libc::PTHREAD_MUTEX_INITIALIZER);
        }
    }

    /// Acquires the mutex, blocking the calling thread.
    pub fn lock(&self) -> PMutexGuard<'_> {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        assert_eq!(rc, 0, "pthread_mutex_lock failed: {}", rc);
        PMutexGuard { mutex: self }
    }

    /// The virtual address of the lock word, used for address-ordered
    /// acquisition when two persistent mutexes must be held together.
    #[inline]
    pub fn addr(&self) -> usize {
        self.inner.get() as usize
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed: {}", rc);
    }
}

/// RAII guard for a [`PMutex`].
pub struct PMutexGuard<'a> {
    mutex: &'a PMutex,
}

impl<'a> Drop for PMutexGuard<'a> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn size_is_one_cache_line() {
        assert_eq!(std::mem::size_of::<PMutex>(), PMUTEX_SIZE);
    }

    #[test]
    fn serializes_threads() {
        // Heap-hosted stand-in for a pmem-resident lock.
        struct Shared {
            lock: PMutex,
            counter: UnsafeCell<u64>,
        }
        unsafe impl Send for Shared {}
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: PMutex {
                inner: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
                _pad: [0; PMUTEX_SIZE - std::mem::size_of::<libc::pthread_mutex_t>()],
            },
            counter: UnsafeCell::new(0),
        });
        shared.lock.init();

        let mut threads = vec![];
        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = shared.lock.lock();
                    unsafe { *shared.counter.get() += 1 };
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(unsafe { *shared.counter.get() }, 4000);
    }
}
