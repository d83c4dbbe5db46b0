// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements word-granular
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory)
//! over a segmented shared region, following the TL2 (Transactional
//! Locking II) algorithm.
//!
//! A [`Region`] owns a shared address space: one fixed first segment plus
//! segments allocated and freed inside transactions. Threads name bytes
//! in it through opaque [`ShmAddr`] values and access them in units of
//! the region's alignment, always from within a [`Transaction`].
//!
//! Reads are speculative and writes stay buffered until commit. At commit
//! the engine decides, against a global version clock and one versioned
//! lock per word, whether the transaction saw a consistent snapshot of
//! memory. If it did, every buffered write is published at a fresh
//! timestamp; if not, nothing is published, the transaction reports
//! [`Aborted`] and the caller simply runs it again. [`atomically`]
//! packages that retry loop.
//!
//! No engine operation ever parks a thread: conflicting commits abort
//! rather than wait, so a transaction running alone always commits.
//!
//! # Usage
//!
//! ```
//! use stm_region::{atomically, Region, TxKind};
//!
//! let region = Region::new(8, 4).unwrap();
//! let start = region.start();
//!
//! // Publish an initial counter value.
//! atomically(&region, |tx| tx.write(&1u32.to_ne_bytes(), start));
//!
//! // Increment it transactionally.
//! atomically(&region, |tx| {
//!     let mut buf = [0u8; 4];
//!     tx.read(start, &mut buf)?;
//!     let value = u32::from_ne_bytes(buf) + 1;
//!     tx.write(&value.to_ne_bytes(), start)
//! });
//!
//! // Observe it with a read-only transaction.
//! let mut tx = region.begin(TxKind::ReadOnly);
//! let mut buf = [0u8; 4];
//! tx.read(start, &mut buf).unwrap();
//! tx.commit().unwrap();
//! assert_eq!(u32::from_ne_bytes(buf), 2);
//! ```
//!
//! # Aborts
//!
//! Any operation may return [`Aborted`] when another commit got in the
//! way. The failed transaction has already rolled itself back; do not try
//! to keep using it, start a new one. Code run inside [`atomically`] must
//! therefore be free of side effects other than the transaction itself,
//! because it may run several times before a commit sticks.
//!
//! # Sizes and alignment
//!
//! Every size passed to [`Transaction::read`], [`Transaction::write`] and
//! [`Transaction::alloc`] must be a positive multiple of the region's
//! alignment, and every address word-aligned. Violations are a programmer
//! error, checked by debug assertions only.

mod addr;
mod clock;
mod region;
mod result;
mod segment;
mod transaction;
mod vlock;


pub use addr::ShmAddr;
pub use region::Region;
pub use result::{Aborted, CreateError, NoMem, TxResult};
pub use transaction::{Transaction, TxKind};

/// Run `f` in a read-write transaction, retrying until a commit sticks,
/// and return its result.
///
/// This is the callers-retry policy packaged up: every abort starts a
/// fresh transaction with a fresh snapshot. `f` must tolerate re-running
/// from scratch and should not have side effects besides the
/// transaction.
///
/// ```
/// # use stm_region::{atomically, Region};
/// let region = Region::new(8, 4).unwrap();
///
/// atomically(&region, |tx| tx.write(&7u32.to_ne_bytes(), region.start()));
/// ```
pub fn atomically<T, F>(region: &Region, f: F) -> T
where
    F: Fn(&mut Transaction) -> TxResult<T>,
{
    loop {
        let mut tx = region.begin(TxKind::ReadWrite);
        if let Ok(value) = f(&mut tx) {
            if tx.commit().is_ok() {
                return value;
            }
        }
    }
}
