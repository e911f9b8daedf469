//! `palloc_operation`: allocate, free and reallocate as a single operation
//! whose durable effects commit atomically through one redo batch.
//!
//! The reservation phase only mutates transient bucket state, so a
//! constructor that cancels — or a crash at any point before
//! `OpContext::process` — leaves durable state exactly as it was. After the
//! commit, the only thing a crash can lose is the transient re-indexing of
//! a freed block, which the next heap boot rediscovers from chunk metadata.

use std::sync::Mutex;

use super::block::{BlockState, HugeBlock, MemBlock, RunBlock};
use super::bucket::{Bucket, FreeSpan, Heap};
use super::layout::{self, chunk_hdr_pack, ChunkType, RunHeader, RUN_UNIT_SIZES};
use super::Mapping;
use crate::ll;
use crate::result::{Error, Result};
use crate::stm::op::OpContext;
use crate::stm::redo::RedoLog;
use crate::sync::PMutexGuard;

#[cfg(feature = "verbose")]
use term_painter::Color::*;

#[cfg(feature = "verbose")]
use term_painter::ToStyle;

/// Runs inside the reservation, before anything durable changes. A `false`
/// return cancels the whole operation with [`Error::Canceled`].
pub type Constructor<'a> = &'a mut dyn FnMut(&mut [u8]) -> bool;

/// The unified allocator entry point.
///
/// * `existing_off == 0` and `size != 0` — allocate.
/// * `existing_off != 0` and `size == 0` — free.
/// * both nonzero — reallocate with an in-pool copy.
/// * both zero — no-op.
///
/// `dest_off`, when given, names a persistent word that receives the new
/// user offset (or zero on a pure free) in the same atomic batch.
pub(crate) fn palloc_operation(
    m: &Mapping,
    heap: &Heap,
    redo: &Mutex<RedoLog>,
    existing_off: u64,
    dest_off: Option<u64>,
    size: usize,
    mut constructor: Option<Constructor<'_>>,
    ctx: &mut OpContext,
) -> Result<u64> {
    if existing_off == 0 && size == 0 {
        return Ok(0);
    }
    if let Some(dest) = dest_off {
        if !m.redo_target_ok(dest) {
            return Err(Error::Inval("bad publish offset"));
        }
    }

    let old_blk = if existing_off != 0 {
        Some(MemBlock::from_user_off(m, existing_off)?)
    } else {
        None
    };

    // Fast path: a reallocation that lands in a block of the same rounded
    // size keeps the old block and touches nothing durable.
    if let (Some(old), true) = (old_blk, size != 0) {
        if rounded_size(heap, size + layout::BLOCK_OVERHEAD) == old.block_size() {
            return Ok(existing_off);
        }
    }

    // -- reservation -------------------------------------------------------
    let mut new_blk = None;
    let mut new_lock: Option<PMutexGuard<'_>> = None;
    if size != 0 {
        let asize = size + layout::BLOCK_OVERHEAD;
        let bucket_mutex = heap.best_bucket(asize);
        let mut bucket = bucket_mutex.lock().unwrap();
        let need = bucket.calc_units(asize);

        let span = match bucket.class() {
            super::bucket::BucketClass::Huge => {
                chunk_best_fit(m, &mut bucket, need).ok_or(Error::NoSpace)?
            }
            super::bucket::BucketClass::Run { class, .. } => {
                match bucket.best_fit(need) {
                    Some(s) => s,
                    None => {
                        grow_run(m, heap, &mut bucket, class)?;
                        bucket.best_fit(need).ok_or(Error::NoSpace)?
                    }
                }
            }
        };
        let blk = span_to_block(&bucket, span);

        #[cfg(feature = "verbose")]
        println!(
            "{}",
            Yellow.paint(format!(
                "  PALLOC  RESERVE {:?} ({} bytes)",
                blk,
                blk.block_size()
            ))
        );

        blk.write_alloc_header(m);
        if let Some(ctor) = constructor.as_mut() {
            let user = unsafe {
                std::slice::from_raw_parts_mut(
                    m.at::<u8>(blk.user_off(m)),
                    blk.usable_size(),
                )
            };
            if !ctor(user) {
                unwind_reservation(&mut bucket, span);
                return Err(Error::Canceled);
            }
            ll::persist(user.as_ptr(), user.len());
        }

        // The deliberate lock overlap: claim the run's bitmap lock before
        // the bucket can hand the revoked span to anyone else.
        new_lock = blk.run_lock(m).map(|l| l.lock());
        drop(bucket);

        blk.prep_hdr(m, BlockState::Allocated, ctx)?;
        new_blk = Some(blk);
    }

    // -- deallocation ------------------------------------------------------
    let mut old_lock: Option<PMutexGuard<'_>> = None;
    let mut freed_huge: Option<(FreeSpan, std::sync::MutexGuard<'_, Bucket>)> = None;
    if let Some(old) = old_blk {
        #[cfg(feature = "check_double_free")]
        {
            if old.get_state(m)? == BlockState::Free {
                panic!("double free of user offset 0x{:x}", existing_off);
            }
        }

        if let Some(lock) = old.run_lock(m) {
            // Dedup against the new block's lock; otherwise honor address
            // order, re-acquiring the new lock when it sorts higher.
            let held = new_lock
                .as_ref()
                .map(|_| new_blk.unwrap().run_lock(m).unwrap().addr());
            match held {
                Some(addr) if addr == lock.addr() => {}
                Some(addr) if lock.addr() < addr => {
                    new_lock = None;
                    old_lock = Some(lock.lock());
                    new_lock = new_blk.unwrap().run_lock(m).map(|l| l.lock());
                }
                _ => old_lock = Some(lock.lock()),
            }
        }

        match old {
            MemBlock::Huge(h) => {
                // Coalesce with both neighbours under the default-bucket
                // lock; the merged span is what becomes durably free.
                let mut dflt = heap.default_bucket().lock().unwrap();
                let (left, right) = dflt.take_chunk_neighbors(h.zone, h.chunk, h.size_idx);
                let mut span = FreeSpan {
                    len: h.size_idx,
                    zone: h.zone,
                    chunk: h.chunk,
                    unit: 0,
                };
                if let Some(l) = left {
                    span.chunk = l.chunk;
                    span.len += l.len;
                }
                if let Some(r) = right {
                    span.len += r.len;
                }
                let merged = MemBlock::Huge(HugeBlock {
                    zone: span.zone,
                    chunk: span.chunk,
                    size_idx: span.len,
                });
                merged.prep_hdr(m, BlockState::Free, ctx)?;
                freed_huge = Some((span, dflt));
            }
            MemBlock::Run(_) => {
                old.prep_hdr(m, BlockState::Free, ctx)?;
            }
        }

        #[cfg(feature = "verbose")]
        println!(
            "{}",
            Magenta.paint(format!("  PALLOC  FREE    {:?}", old))
        );
    }

    // -- copy (realloc only) ----------------------------------------------
    if let (Some(old), Some(new)) = (old_blk, new_blk) {
        let n = std::cmp::min(old.usable_size(), new.usable_size());
        ll::memcpy_persist(
            unsafe { m.at::<u8>(new.user_off(m)) },
            unsafe { m.at::<u8>(old.user_off(m)) },
            n,
        );
    }

    // -- publish -----------------------------------------------------------
    let new_user_off = new_blk.map(|b| b.user_off(m)).unwrap_or(0);
    if let Some(dest) = dest_off {
        ctx.add_set(dest, new_user_off)?;
    }

    // -- commit ------------------------------------------------------------
    {
        let mut redo = redo.lock().unwrap();
        ctx.process(&mut redo)?;
    }

    // -- post-commit: transient reclaim only -------------------------------
    // Run locks go first: re-indexing takes a bucket lock, and bucket
    // before run is the only acquisition order the reservation allows.
    // The freed units are in no bucket yet, so nothing can serve them
    // between the unlock and the insert.
    drop(new_lock);
    drop(old_lock);
    if let Some((span, mut dflt)) = freed_huge.take() {
        dflt.insert(span);
    } else if let Some(MemBlock::Run(r)) = old_blk {
        let class = RUN_UNIT_SIZES
            .iter()
            .position(|u| *u as u32 == r.unit_size)
            .expect("freed run block of a known class");
        let mut bucket = heap.run_bucket(class).lock().unwrap();
        let (left, right) = bucket.take_unit_neighbors(r.zone, r.chunk, r.unit, r.units);
        let mut span = FreeSpan {
            len: r.units,
            zone: r.zone,
            chunk: r.chunk,
            unit: r.unit,
        };
        if let Some(l) = left {
            span.unit = l.unit;
            span.len += l.len;
        }
        if let Some(rr) = right {
            span.len += rr.len;
        }
        bucket.insert(span);
    }

    Ok(new_user_off)
}

/// The rounded, header-inclusive size class `asize` would be served with.
fn rounded_size(heap: &Heap, asize: usize) -> usize {
    let bucket = heap.best_bucket(asize).lock().unwrap();
    let units = bucket.calc_units(asize);
    match bucket.class() {
        super::bucket::BucketClass::Huge => units as usize * layout::CHUNK_SIZE,
        super::bucket::BucketClass::Run { unit_size, .. } => {
            units as usize * unit_size as usize
        }
    }
}

fn span_to_block(bucket: &Bucket, span: FreeSpan) -> MemBlock {
    match bucket.class() {
        super::bucket::BucketClass::Huge => MemBlock::Huge(HugeBlock {
            zone: span.zone,
            chunk: span.chunk,
            size_idx: span.len,
        }),
        super::bucket::BucketClass::Run { unit_size, .. } => MemBlock::Run(RunBlock {
            zone: span.zone,
            chunk: span.chunk,
            unit: span.unit,
            units: span.len,
            unit_size,
        }),
    }
}

/// Returns a canceled reservation to its bucket, merging with whatever it
/// was split from. Durable state never changed, so this is pure bookkeeping.
fn unwind_reservation(bucket: &mut Bucket, span: FreeSpan) {
    let (left, right) = match bucket.class() {
        super::bucket::BucketClass::Huge => {
            bucket.take_chunk_neighbors(span.zone, span.chunk, span.len)
        }
        super::bucket::BucketClass::Run { .. } => {
            bucket.take_unit_neighbors(span.zone, span.chunk, span.unit, span.len)
        }
    };
    let mut merged = span;
    if let Some(l) = left {
        match bucket.class() {
            super::bucket::BucketClass::Huge => merged.chunk = l.chunk,
            super::bucket::BucketClass::Run { .. } => merged.unit = l.unit,
        }
        merged.len += l.len;
    }
    if let Some(r) = right {
        merged.len += r.len;
    }
    bucket.insert(merged);
}

/// Best-fit over whole chunks. When the winning span is cut, the tail's
/// chunk header is persisted before the bucket lock drops: the walk reads
/// headers span by span, so the tail must be self-describing the moment
/// the head span can change state. The tail stays free either way, which
/// makes the eager write crash-neutral.
fn chunk_best_fit(m: &Mapping, bucket: &mut Bucket, need: u32) -> Option<FreeSpan> {
    let span = bucket.best_fit(need)?;
    if let Some(tail) = bucket.span_starting_at(span.zone, span.chunk + span.len) {
        let geom = &m.zones[span.zone as usize];
        unsafe {
            let hdr = m.at::<u64>(geom.chunk_hdr_off(tail.chunk));
            *hdr = chunk_hdr_pack(ChunkType::Free, tail.len);
            ll::persist(hdr as *const u8, 8);
        }
    }
    Some(span)
}

/// Converts one free chunk into an empty run of `class` and indexes its
/// units. The conversion is durable immediately: an empty run commutes with
/// every other operation, so it needs no transaction — a crash leaves a
/// fully-free run the next boot simply re-indexes.
fn grow_run(
    m: &Mapping,
    heap: &Heap,
    bucket: &mut Bucket,
    class: usize,
) -> Result<()> {
    let unit_size = RUN_UNIT_SIZES[class];
    let span = {
        let mut dflt = heap.default_bucket().lock().unwrap();
        chunk_best_fit(m, &mut dflt, 1).ok_or(Error::NoSpace)?
    };
    let geom = &m.zones[span.zone as usize];
    let chunk_off = geom.chunk_off(span.chunk);
    let units = layout::units_per_run(unit_size);

    unsafe {
        let run = &mut *m.at::<RunHeader>(chunk_off);
        run.lock.init();
        run.block_size = unit_size as u64;
        for w in run.bitmap.iter_mut() {
            *w = 0;
        }
        for unit in 0..units as usize {
            run.bitmap[unit / 64] |= 1u64 << (unit % 64);
        }
        ll::persist(run as *const RunHeader as *const u8, layout::RUN_DATA_OFF);

        // Only after the run header is durable may the chunk change type.
        let hdr = m.at::<u64>(geom.chunk_hdr_off(span.chunk));
        *hdr = chunk_hdr_pack(ChunkType::Run, 1);
        ll::persist(hdr as *const u8, 8);
    }

    #[cfg(feature = "verbose")]
    println!(
        "{}",
        Yellow.paint(format!(
            "  PALLOC  NEW RUN zone {} chunk {} unit {}",
            span.zone, span.chunk, unit_size
        ))
    );

    bucket.insert(FreeSpan {
        len: units,
        zone: span.zone,
        chunk: span.chunk,
        unit: 0,
    });
    Ok(())
}
