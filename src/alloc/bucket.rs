//! The transient bucket index. Buckets are rebuilt from chunk metadata at
//! pool open, mutated under their own mutexes while the pool is live, and
//! discarded at close; nothing here is ever persisted.
//!
//! One bucket exists per size class: the *huge* bucket indexes spans of
//! whole free chunks, each *run* bucket indexes spans of free units inside
//! run chunks of its class. Selection is best-fit: the smallest span that
//! satisfies the request wins, and any excess is split off and re-indexed.

use std::collections::BTreeSet;
use std::sync::Mutex;

use super::layout::{
    self, chunk_hdr_unpack, ChunkType, RunHeader, RUN_UNIT_SIZES,
};
use super::Mapping;
use crate::result::{Error, Result};

/// A span of free space as indexed by a bucket. Ordered by length first so
/// a `BTreeSet` range scan is exactly best-fit; position fields break ties
/// to keep the ordering total.
///
/// For huge spans `len` counts chunks and `unit` is zero; for run spans
/// `len` counts units inside the run chunk `chunk`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeSpan {
    pub len: u32,
    pub zone: u32,
    pub chunk: u32,
    pub unit: u32,
}

/// What a bucket's spans are made of.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BucketClass {
    /// Whole chunks.
    Huge,
    /// Units of `unit_size` bytes inside run chunks of class `class`.
    Run { class: usize, unit_size: u32 },
}

/// A per-size-class container of free spans.
pub struct Bucket {
    class: BucketClass,
    free: BTreeSet<FreeSpan>,
}

impl Bucket {
    pub fn new(class: BucketClass) -> Self {
        Bucket {
            class,
            free: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn class(&self) -> BucketClass {
        self.class
    }

    /// Spans currently indexed.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Allocation granules needed for a header-inclusive size.
    pub fn calc_units(&self, asize: usize) -> u32 {
        match self.class {
            BucketClass::Huge => layout::chunks_for_size(asize),
            BucketClass::Run { unit_size, .. } => {
                ((asize + unit_size as usize - 1) / unit_size as usize) as u32
            }
        }
    }

    pub fn insert(&mut self, span: FreeSpan) {
        debug_assert!(span.len > 0);
        let fresh = self.free.insert(span);
        debug_assert!(fresh, "span indexed twice: {:?}", span);
    }

    pub fn remove(&mut self, span: &FreeSpan) -> bool {
        self.free.remove(span)
    }

    /// Takes the smallest span of at least `len` granules. When the winner
    /// is larger the tail is split off and stays indexed.
    pub fn best_fit(&mut self, len: u32) -> Option<FreeSpan> {
        let probe = FreeSpan {
            len,
            zone: 0,
            chunk: 0,
            unit: 0,
        };
        let won = *self.free.range(probe..).next()?;
        self.free.remove(&won);
        if won.len > len {
            let tail = match self.class {
                BucketClass::Huge => FreeSpan {
                    len: won.len - len,
                    chunk: won.chunk + len,
                    ..won
                },
                BucketClass::Run { .. } => FreeSpan {
                    len: won.len - len,
                    unit: won.unit + len,
                    ..won
                },
            };
            self.free.insert(tail);
        }
        Some(FreeSpan { len, ..won })
    }

    /// The indexed span starting exactly at `chunk` of `zone`, if any.
    pub fn span_starting_at(&self, zone: u32, chunk: u32) -> Option<FreeSpan> {
        self.free
            .iter()
            .find(|s| s.zone == zone && s.chunk == chunk)
            .copied()
    }

    /// Removes and returns the free spans directly adjacent (in chunk
    /// space) to `[chunk, chunk + len)` of `zone`.
    pub fn take_chunk_neighbors(
        &mut self,
        zone: u32,
        chunk: u32,
        len: u32,
    ) -> (Option<FreeSpan>, Option<FreeSpan>) {
        debug_assert_eq!(self.class, BucketClass::Huge);
        let left = self
            .free
            .iter()
            .find(|s| s.zone == zone && s.chunk + s.len == chunk)
            .copied();
        let right = self
            .free
            .iter()
            .find(|s| s.zone == zone && s.chunk == chunk + len)
            .copied();
        if let Some(l) = left {
            self.free.remove(&l);
        }
        if let Some(r) = right {
            self.free.remove(&r);
        }
        (left, right)
    }

    /// Removes and returns the free spans directly adjacent (in unit space)
    /// to `[unit, unit + len)` of the run chunk `(zone, chunk)`.
    pub fn take_unit_neighbors(
        &mut self,
        zone: u32,
        chunk: u32,
        unit: u32,
        len: u32,
    ) -> (Option<FreeSpan>, Option<FreeSpan>) {
        let left = self
            .free
            .iter()
            .find(|s| s.zone == zone && s.chunk == chunk && s.unit + s.len == unit)
            .copied();
        let right = self
            .free
            .iter()
            .find(|s| s.zone == zone && s.chunk == chunk && s.unit == unit + len)
            .copied();
        if let Some(l) = left {
            self.free.remove(&l);
        }
        if let Some(r) = right {
            self.free.remove(&r);
        }
        (left, right)
    }
}

/// The volatile heap runtime: one mutex-guarded bucket per size class.
pub struct Heap {
    huge: Mutex<Bucket>,
    runs: Vec<Mutex<Bucket>>,
}

impl Heap {
    fn empty() -> Self {
        Heap {
            huge: Mutex::new(Bucket::new(BucketClass::Huge)),
            runs: RUN_UNIT_SIZES
                .iter()
                .enumerate()
                .map(|(class, unit)| {
                    Mutex::new(Bucket::new(BucketClass::Run {
                        class,
                        unit_size: *unit as u32,
                    }))
                })
                .collect(),
        }
    }

    /// The bucket serving a header-inclusive size.
    pub fn best_bucket(&self, asize: usize) -> &Mutex<Bucket> {
        match layout::class_for_size(asize) {
            Some(class) => &self.runs[class],
            None => &self.huge,
        }
    }

    /// The huge bucket; also the lock that serializes chunk coalescing.
    #[inline]
    pub fn default_bucket(&self) -> &Mutex<Bucket> {
        &self.huge
    }

    /// The bucket of run class `class`.
    #[inline]
    pub fn run_bucket(&self, class: usize) -> &Mutex<Bucket> {
        &self.runs[class]
    }

    /// Free chunks currently indexed, for pool statistics.
    pub fn free_chunks(&self) -> u32 {
        // TODO: demote fully-free runs back to the huge bucket so they
        // count here and can change class.
        let huge = self.huge.lock().unwrap();
        huge.free.iter().map(|s| s.len).sum()
    }

    /// Rebuilds the index from on-media chunk state. Walks every zone,
    /// re-arms every run lock, and indexes free chunk spans and free unit
    /// spans. Runs after redo recovery, so the metadata it reads is
    /// consistent.
    pub fn rebuild(m: &Mapping) -> Result<Heap> {
        let heap = Heap::empty();
        for (zone_id, geom) in m.zones.iter().enumerate() {
            let zone_id = zone_id as u32;
            unsafe { &*m.at::<layout::ZoneHeader>(geom.off as u64) }.check()?;
            let mut prev_free = false;
            let mut chunk = 0u32;
            while chunk < geom.chunks {
                let (t, size_idx) = chunk_hdr_unpack(m.word(geom.chunk_hdr_off(chunk)))?;
                if size_idx == 0 || chunk as u64 + size_idx as u64 > geom.chunks as u64 {
                    return Err(Error::Corruption("chunk span out of zone"));
                }
                match t {
                    ChunkType::Free => {
                        if prev_free {
                            return Err(Error::Corruption("adjacent free chunks"));
                        }
                        prev_free = true;
                        heap.huge.lock().unwrap().insert(FreeSpan {
                            len: size_idx,
                            zone: zone_id,
                            chunk,
                            unit: 0,
                        });
                        chunk += size_idx;
                    }
                    ChunkType::Used => {
                        prev_free = false;
                        chunk += size_idx;
                    }
                    ChunkType::Run => {
                        prev_free = false;
                        let run = unsafe { &*m.at::<RunHeader>(geom.chunk_off(chunk)) };
                        run.lock.init();
                        let class = RUN_UNIT_SIZES
                            .iter()
                            .position(|u| *u as u64 == run.block_size)
                            .ok_or(Error::Corruption("run of unknown size class"))?;
                        let units = layout::units_per_run(run.block_size as usize);
                        let mut bucket = heap.runs[class].lock().unwrap();
                        let mut span_start = None;
                        for unit in 0..=units {
                            let free = unit < units
                                && run.bitmap[unit as usize / 64]
                                    >> (unit as usize % 64)
                                    & 1
                                    != 0;
                            match (span_start, free) {
                                (None, true) => span_start = Some(unit),
                                (Some(start), false) => {
                                    bucket.insert(FreeSpan {
                                        len: unit - start,
                                        zone: zone_id,
                                        chunk,
                                        unit: start,
                                    });
                                    span_start = None;
                                }
                                _ => {}
                            }
                        }
                        chunk += 1;
                    }
                }
            }
        }
        Ok(heap)
    }
}
