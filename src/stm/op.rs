//! The operation context: an append-only batch of pending word updates
//! belonging to one logical transaction. Entries accumulate in volatile
//! memory only; nothing touches the durable log until
//! [`OpContext::process`] hands the batch to the redo log, so an abandoned
//! context has no durable footprint at all.

use crate::stm::redo::RedoLog;
use crate::result::{Error, Result};

/// How a pending update combines with the target word.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OpKind {
    /// Write `value` to the word.
    Set,
    /// Clear the bits absent from the mask: `old & mask`.
    And,
    /// Set the bits of the mask: `old | mask`.
    Or,
}

#[derive(Copy, Clone)]
struct PendingEntry {
    off: u64,
    value: u64,
}

/// Accumulates `{offset, value, kind}` updates and drives redo commit.
///
/// `And`/`Or` entries are resolved to absolute values as they are appended:
/// against the pending value when the batch already targets the same word,
/// otherwise against the current durable value. Replay order within a batch
/// is unspecified, so the context also keeps at most one entry per word.
pub struct OpContext {
    base: *mut u8,
    entries: Vec<PendingEntry>,
    capacity: usize,
}

unsafe impl Send for OpContext {}

impl OpContext {
    /// A context bounded by `capacity`, the redo log's payload size.
    pub fn new(base: *mut u8, capacity: usize) -> Self {
        OpContext {
            base,
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The value the target word will hold once this batch commits.
    fn pending_value(&self, off: u64) -> Option<u64> {
        self.entries.iter().rev().find(|e| e.off == off).map(|e| e.value)
    }

    /// The current durable value of the word at `off`.
    #[inline]
    fn durable_value(&self, off: u64) -> u64 {
        unsafe { *(self.base.add(off as usize) as *const u64) }
    }

    /// Appends an update of `kind` for the word at `off`.
    pub fn add(&mut self, off: u64, operand: u64, kind: OpKind) -> Result<()> {
        debug_assert_eq!(off % 8, 0, "redo targets are 8-byte words");
        let value = match kind {
            OpKind::Set => operand,
            OpKind::And => self.resolve(off) & operand,
            OpKind::Or => self.resolve(off) | operand,
        };
        if let Some(e) = self.entries.iter_mut().find(|e| e.off == off) {
            e.value = value;
            return Ok(());
        }
        if self.entries.len() == self.capacity {
            return Err(Error::Capacity);
        }
        self.entries.push(PendingEntry { off, value });
        Ok(())
    }

    /// Shorthand for a `Set` entry.
    #[inline]
    pub fn add_set(&mut self, off: u64, value: u64) -> Result<()> {
        self.add(off, value, OpKind::Set)
    }

    fn resolve(&self, off: u64) -> u64 {
        self.pending_value(off)
            .unwrap_or_else(|| self.durable_value(off))
    }

    /// The value the word at `off` will hold after this batch commits:
    /// the pending value if staged, the durable value otherwise. Callers
    /// use it to stage read-modify-write counters.
    #[inline]
    pub fn resolved(&self, off: u64) -> u64 {
        self.resolve(off)
    }

    /// Discards all pending entries, leaving durable state untouched.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Finalizes the batch: stages every entry, seals the last with the
    /// finish flag and commits through the redo log. On success the context
    /// is empty and reusable.
    pub fn process(&mut self, redo: &mut RedoLog) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        for e in &self.entries {
            redo.store(e.off, e.value)?;
        }
        redo.commit();
        self.entries.clear();
        Ok(())
    }
}
