// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::BTreeMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::addr::ShmAddr;
use crate::region::Region;
use crate::result::{Aborted, NoMem, TxResult};
use crate::segment::Segment;

/// Whether a transaction intends to write.
///
/// Read-only transactions record no read set: every read is individually
/// validated against the read version, which is all the consistency a
/// transaction needs when it will never publish anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    ReadWrite,
    ReadOnly,
}

/// A live transaction on a shared region.
///
/// Reads are speculative and writes stay buffered in a private log until
/// [`commit`](Transaction::commit) publishes them all at once, or not at
/// all. Any operation returning [`Aborted`] has already rolled the
/// transaction back; dropping the handle without committing rolls back
/// too.
///
/// A transaction is bound to the thread that began it and must be
/// finished there.
pub struct Transaction<'r> {
    region: &'r Region,
    kind: TxKind,
    /// Snapshot of the version clock at begin.
    rv: u64,
    /// Addresses observed by speculative reads, in observation order.
    reads: Vec<ShmAddr>,
    /// Private copies to publish, keyed by target word. The key order
    /// fixes the lock acquisition order at commit.
    writes: BTreeMap<ShmAddr, Box<[u8]>>,
    /// Segments this transaction has marked for deletion.
    frees: Vec<ShmAddr>,
    finished: bool,
}

impl<'r> Transaction<'r> {
    pub(crate) fn new(region: &'r Region, kind: TxKind, rv: u64) -> Transaction<'r> {
        Transaction {
            region,
            kind,
            rv,
            reads: Vec::new(),
            writes: BTreeMap::new(),
            frees: Vec::new(),
            finished: false,
        }
    }

    /// Speculatively read `dst.len()` bytes starting at `src` into `dst`.
    ///
    /// Each word is sampled, copied and re-sampled; if its lock moved in
    /// between, or the word carries a version newer than this
    /// transaction's snapshot, the transaction aborts. Words this
    /// transaction has already written come from the private log instead.
    ///
    /// `dst.len()` must be a positive multiple of the region's alignment
    /// and `src` word-aligned.
    pub fn read(&mut self, src: ShmAddr, dst: &mut [u8]) -> TxResult<()> {
        if self.finished {
            return Err(Aborted);
        }
        let align = self.region.alignment();
        debug_assert!(
            !dst.is_empty() && dst.len() % align == 0,
            "read size must be a positive multiple of the alignment"
        );
        debug_assert!(src.offset() as usize % align == 0);

        let Some(segment) = self.region.resolve(src) else {
            return self.fail("read from an unmapped segment");
        };
        let first_word = src.offset() as usize / align;
        if first_word + dst.len() / align > segment.word_count() {
            return self.fail("read past the end of the segment");
        }

        for (i, chunk) in dst.chunks_exact_mut(align).enumerate() {
            let addr = src + i * align;

            // Read-your-own-writes: serve from the private log.
            if self.kind == TxKind::ReadWrite {
                if let Some(private) = self.writes.get(&addr) {
                    chunk.copy_from_slice(private);
                    continue;
                }
            }

            let lock = segment.lock(first_word + i);

            let pre = lock.sample();
            if pre.locked || pre.version > self.rv {
                return self.fail("read observed a locked or newer word");
            }

            segment.read_word(first_word + i, chunk);

            // Order the payload copy before the re-sample.
            fence(Ordering::Acquire);

            let post = lock.sample();
            if post.locked || post.version != pre.version || post.version > self.rv {
                return self.fail("word changed under a speculative read");
            }

            if self.kind == TxKind::ReadWrite {
                self.reads.push(addr);
            }
        }
        Ok(())
    }

    /// Buffer `src` for publication at `dst` when the transaction
    /// commits.
    ///
    /// A second write to the same word replaces the first; nothing
    /// becomes visible to other transactions before commit.
    ///
    /// `src.len()` must be a positive multiple of the region's alignment
    /// and `dst` word-aligned.
    pub fn write(&mut self, src: &[u8], dst: ShmAddr) -> TxResult<()> {
        if self.finished {
            return Err(Aborted);
        }
        let align = self.region.alignment();
        debug_assert!(
            !src.is_empty() && src.len() % align == 0,
            "write size must be a positive multiple of the alignment"
        );
        debug_assert!(dst.offset() as usize % align == 0);

        if self.kind == TxKind::ReadOnly {
            return self.fail("write inside a read-only transaction");
        }

        for (i, chunk) in src.chunks_exact(align).enumerate() {
            self.writes
                .insert(dst + i * align, chunk.to_vec().into_boxed_slice());
        }
        Ok(())
    }

    /// Allocate a fresh zeroed segment of `size` bytes and return its
    /// first address.
    ///
    /// Failure does not abort the transaction. The allocation itself is
    /// not transactional: a segment allocated by a transaction that later
    /// aborts simply stays unused until the region is dropped.
    pub fn alloc(&mut self, size: usize) -> Result<ShmAddr, NoMem> {
        if self.finished {
            return Err(NoMem);
        }
        debug_assert!(
            size > 0 && size % self.region.alignment() == 0,
            "allocation size must be a positive multiple of the alignment"
        );
        self.region.allocate(size)
    }

    /// Mark the segment at `addr` for deletion.
    ///
    /// The storage is released only after this transaction commits, and
    /// only once no transaction that could still read the segment
    /// remains. Two transactions freeing the same segment conflict; the
    /// second aborts.
    ///
    /// `addr` must be the start address of a segment returned by
    /// [`alloc`](Transaction::alloc).
    pub fn free(&mut self, addr: ShmAddr) -> TxResult<()> {
        if self.finished {
            return Err(Aborted);
        }
        debug_assert!(
            addr.segment() != 0 && addr.offset() == 0,
            "free takes the start address of an allocated segment"
        );

        if self.kind == TxKind::ReadOnly {
            return self.fail("free inside a read-only transaction");
        }
        let Some(segment) = self.region.resolve(addr) else {
            return self.fail("free of an unmapped segment");
        };
        if !segment.try_retire() {
            return self.fail("segment already marked for deletion");
        }
        self.frees.push(addr);
        Ok(())
    }

    /// Try to publish the transaction.
    ///
    /// Read-only transactions (and read-write ones that wrote and freed
    /// nothing) commit immediately: their reads were each validated
    /// against the snapshot when taken. Everything else runs the
    /// two-phase protocol: acquire every write lock, mint the write
    /// version, re-validate the read set, then publish each word and
    /// release its lock at the new version.
    ///
    /// On `Err` nothing was published and the transaction has rolled
    /// back; the caller retries with a fresh transaction.
    pub fn commit(mut self) -> TxResult<()> {
        // A failed operation has already rolled the state back; ending
        // the transaction then just reports the abort.
        if self.finished {
            return Err(Aborted);
        }

        if self.kind == TxKind::ReadOnly || (self.writes.is_empty() && self.frees.is_empty()) {
            trace!(rv = self.rv, "trivial commit");
            self.finish();
            return Ok(());
        }

        let align = self.region.alignment();
        let mut targets: Vec<(Arc<Segment>, usize)> = Vec::with_capacity(self.writes.len());
        for addr in self.writes.keys() {
            match self.region.resolve(*addr) {
                Some(segment) => targets.push((segment, addr.offset() as usize / align)),
                None => break,
            }
        }
        if targets.len() != self.writes.len() {
            debug!(rv = self.rv, "write target vanished");
            self.rollback();
            return Err(Aborted);
        }

        // Phase one: take every write lock, in write-set order. No
        // waiting; losing the race to any lock aborts the whole commit.
        for (held, (segment, index)) in targets.iter().enumerate() {
            if !segment.lock(*index).try_acquire() {
                for (seg, idx) in &targets[..held] {
                    seg.lock(*idx).release();
                }
                trace!(rv = self.rv, "commit lost a lock race");
                self.rollback();
                return Err(Aborted);
            }
        }

        // Phase two: mint the write version.
        let wv = self.region.clock().tick();

        // If the clock moved by exactly one since begin, no other commit
        // interleaved and the read set cannot have been invalidated.
        if self.rv + 1 != wv && !self.validate() {
            for (seg, idx) in &targets {
                seg.lock(*idx).release();
            }
            trace!(rv = self.rv, wv, "read set validation failed");
            self.rollback();
            return Err(Aborted);
        }

        // Publish: copy each private value over, then release its lock
        // at the write version in the same store.
        for ((_, value), (segment, index)) in self.writes.iter().zip(&targets) {
            segment.write_word(*index, value);
            segment.lock(*index).release_at(wv);
        }

        // Freed segments go to limbo; stragglers keep resolving them
        // until every transaction older than this commit is gone.
        for addr in &self.frees {
            self.region.finalize_free(*addr, wv);
        }

        trace!(
            rv = self.rv,
            wv,
            writes = self.writes.len(),
            "transaction committed"
        );
        self.finish();
        Ok(())
    }

    /// Re-check every speculatively read word against the snapshot.
    ///
    /// A lock held by this transaction's own commit passes; acquisition
    /// leaves the version untouched, so a conflicting commit that slipped
    /// in between the read and our lock phase is still caught by the
    /// version test.
    fn validate(&self) -> bool {
        let align = self.region.alignment();
        for addr in &self.reads {
            let Some(segment) = self.region.resolve(*addr) else {
                return false;
            };
            let sample = segment.lock(addr.offset() as usize / align).sample();
            if sample.version > self.rv {
                return false;
            }
            if sample.locked && !self.writes.contains_key(addr) {
                return false;
            }
        }
        true
    }

    /// Roll back and report the conflict to the caller.
    fn fail(&mut self, why: &'static str) -> TxResult<()> {
        debug!(rv = self.rv, why, "transaction aborted");
        self.rollback();
        Err(Aborted)
    }

    /// Drop all speculative state and undo the deletion marks, leaving
    /// the shared region as if this transaction had never run.
    fn rollback(&mut self) {
        for addr in self.frees.drain(..) {
            if let Some(segment) = self.region.resolve(addr) {
                segment.cancel_retire();
            }
        }
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.region.deregister(self.rv);
            self.finished = true;
        }
    }
}

impl Drop for Transaction<'_> {
    /// Abandoning a transaction aborts it.
    fn drop(&mut self) {
        if !self.finished {
            trace!(rv = self.rv, "transaction abandoned");
            self.rollback();
        }
    }
}
