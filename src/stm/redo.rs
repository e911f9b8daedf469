//! The redo log: atomically commits a bounded batch of 8-byte word writes
//! to arbitrary in-pool offsets.
//!
//! The durable region is an array of fixed-width `{offset, value}` entries.
//! Entry 0 is reserved for the checksum pair `{off_csum, val_csum}`; entries
//! `1..` carry the payload. Bit 0 of an entry's offset is the *finish flag*
//! marking the last entry of a batch; its value is still applied.
//!
//! At any durable moment the log has exactly one of three shapes:
//!
//! * **empty** — entry 0 is `{0, 0}`;
//! * **complete** — a finish flag exists and both checksums match;
//! * **torn** — anything else, scrubbed to empty during recovery.
//!
//! The commit path builds the batch in a volatile shadow, seals it (finish
//! flag, checksums, 0xFF slack up to the cache-line boundary), publishes the
//! shadow with one write-combining copy and a drain, applies every entry to
//! its target word, and finally scrubs the first cache line. A crash before
//! the drain leaves the checksum unmatched (torn); a crash after it leaves a
//! complete log whose replay is idempotent because every entry is a whole
//! word at a fixed offset.

use crate::ll;
use crate::result::{Error, Result};

#[cfg(feature = "verbose")]
use term_painter::Color::*;

#[cfg(feature = "verbose")]
use term_painter::ToStyle;

/// Bit 0 of a stored offset: this entry ends the batch.
pub const FINISH_FLAG: u64 = 1;

/// One durable log slot.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Debug)]
pub struct RedoEntry {
    pub offset: u64,
    pub value: u64,
}

const ENTRY_SIZE: usize = std::mem::size_of::<RedoEntry>();

/// Checksums over the stored offset and value columns of a payload slice.
pub(crate) fn checksum_pair(entries: &[RedoEntry]) -> (u64, u64) {
    let mut off_csum = crc32fast::Hasher::new();
    let mut val_csum = crc32fast::Hasher::new();
    for e in entries {
        off_csum.update(&e.offset.to_ne_bytes());
        val_csum.update(&e.value.to_ne_bytes());
    }
    (off_csum.finalize() as u64, val_csum.finalize() as u64)
}

/// A redo log bound to one durable entry array inside a mapped pool.
///
/// The pool base may move between opens; the log stores only pool-relative
/// offsets and re-binds to the new base.
pub struct RedoLog {
    base: *mut u8,
    log_off: u64,
    capacity: usize,
    shadow: Box<[RedoEntry]>,
    used: usize,
}

unsafe impl Send for RedoLog {}

impl RedoLog {
    /// Binds a log to `capacity` payload entries at pool offset `log_off`.
    /// The durable area spans `capacity + 1` entries and must be a whole
    /// number of cache lines.
    pub fn new(base: *mut u8, log_off: u64, capacity: usize) -> Self {
        debug_assert_eq!(log_off as usize % ll::CACHELINE, 0);
        debug_assert_eq!(((capacity + 1) * ENTRY_SIZE) % ll::CACHELINE, 0);
        RedoLog {
            base,
            log_off,
            capacity,
            shadow: vec![RedoEntry::default(); capacity + 1].into_boxed_slice(),
            used: 0,
        }
    }

    /// Payload entries one batch can carry.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Payload entries currently staged.
    #[inline]
    pub fn staged(&self) -> usize {
        self.used
    }

    #[inline]
    fn pmem(&self) -> *mut RedoEntry {
        unsafe { self.base.add(self.log_off as usize) as *mut RedoEntry }
    }

    #[inline]
    unsafe fn word(&self, off: u64) -> *mut u64 {
        self.base.add(off as usize) as *mut u64
    }

    /// Stages one word write. Offsets must leave bit 0 clear; the finish
    /// flag is owned by [`commit`](Self::commit).
    pub fn store(&mut self, offset: u64, value: u64) -> Result<()> {
        debug_assert_eq!(offset & FINISH_FLAG, 0, "unaligned redo offset");
        if self.used == self.capacity {
            return Err(Error::Capacity);
        }
        self.used += 1;
        self.shadow[self.used] = RedoEntry { offset, value };

        #[cfg(feature = "verbose")]
        println!(
            "{}",
            Yellow.paint(format!(
                "    REDO  STORE  [{:>3}]  0x{:08x} <- 0x{:016x}",
                self.used, offset, value
            ))
        );
        Ok(())
    }

    /// Seals and durably applies the staged batch, then resets the log to
    /// empty. A no-op when nothing is staged.
    pub fn commit(&mut self) {
        if self.used == 0 {
            return;
        }
        self.shadow[self.used].offset |= FINISH_FLAG;

        let (off_csum, val_csum) = checksum_pair(&self.shadow[1..=self.used]);
        self.shadow[0] = RedoEntry {
            offset: off_csum,
            value: val_csum,
        };

        // Publish whole cache lines; slack bytes are 0xFF so a torn line can
        // never masquerade as a valid prefix of the next batch.
        let dirty = (self.used + 1) * ENTRY_SIZE;
        let publish = (dirty + ll::CACHELINE - 1) & !(ll::CACHELINE - 1);
        let bytes = self.shadow.as_mut_ptr() as *mut u8;
        unsafe {
            std::ptr::write_bytes(bytes.add(dirty), 0xFF, publish - dirty);
        }
        ll::memcpy_wc(self.pmem() as *mut u8, bytes as *const u8, publish);
        ll::drain();

        #[cfg(feature = "verbose")]
        println!(
            "{}",
            Yellow.paint(format!(
                "    REDO  COMMIT {} entries, csum {:08x}/{:08x}",
                self.used, off_csum, val_csum
            ))
        );

        let last = self.used;
        for i in 1..=last {
            let e = self.shadow[i];
            let off = e.offset & !FINISH_FLAG;
            unsafe {
                let dst = self.word(off);
                *dst = e.value;
                if i == last {
                    ll::persist(dst as *const u8, 8);
                } else {
                    ll::flush(dst as *const u8, 8);
                }
            }
        }

        self.scrub();
        for e in self.shadow[..=last].iter_mut() {
            *e = RedoEntry::default();
        }
        self.used = 0;
    }

    /// Zeroes the first cache line of the durable log and drains, returning
    /// the log to the `empty` shape.
    fn scrub(&self) {
        ll::memset_wc(self.pmem() as *mut u8, 0, ll::CACHELINE);
        ll::drain();
    }

    /// Verifies and, if needed, replays the durable log. Runs at pool open
    /// before any client work. `check_offset` bounds every recovered target
    /// word to the intended persistent region.
    pub fn recover(&mut self, check_offset: &dyn Fn(u64) -> bool) -> Result<()> {
        let pmem = self.pmem();
        let head = unsafe { *pmem };
        if head == RedoEntry::default() {
            return Ok(());
        }

        let mut finish = 0;
        for i in 1..=self.capacity {
            let e = unsafe { *pmem.add(i) };
            if e.offset & FINISH_FLAG != 0 {
                finish = i;
                break;
            }
        }
        if finish == 0 {
            // A nonzero checksum entry without a finish flag cannot be a
            // sealed batch; the log was never used to completion.
            return Ok(());
        }

        let entries: Vec<RedoEntry> =
            (1..=finish).map(|i| unsafe { *pmem.add(i) }).collect();
        let (off_csum, val_csum) = checksum_pair(&entries);
        if off_csum != head.offset || val_csum != head.value {
            #[cfg(feature = "verbose")]
            println!(
                "{}",
                Magenta.paint(format!(
                    "    REDO  TORN   {} entries discarded",
                    finish
                ))
            );
            self.scrub();
            return Ok(());
        }

        for e in &entries {
            if !check_offset(e.offset & !FINISH_FLAG) {
                return Err(Error::Corruption("redo entry offset out of range"));
            }
        }

        #[cfg(feature = "verbose")]
        println!(
            "{}",
            Magenta.paint(format!("    REDO  REPLAY {} entries", finish))
        );

        for (i, e) in entries.iter().enumerate() {
            let off = e.offset & !FINISH_FLAG;
            unsafe {
                let dst = self.word(off);
                *dst = e.value;
                if i + 1 == entries.len() {
                    ll::persist(dst as *const u8, 8);
                } else {
                    ll::flush(dst as *const u8, 8);
                }
            }
        }
        self.scrub();
        Ok(())
    }
}
