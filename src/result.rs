// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use thiserror::Error;

/// Rejected construction parameters for a shared region.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    #[error("alignment must be a nonzero power of two")]
    BadAlignment,
    #[error("region size must be a positive multiple of the alignment")]
    BadSize,
}

/// The transaction observed a conflicting commit and rolled itself back.
///
/// The handle is finished once this is returned: buffered writes are
/// discarded, deletion marks are undone, and nothing was published. The
/// caller retries by starting a new transaction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("transaction aborted by a conflicting commit")]
pub struct Aborted;

/// The segment table has no free slot left.
///
/// Unlike [`Aborted`] this does not end the transaction; the caller may
/// keep going without the allocation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("shared region has no free segment slot")]
pub struct NoMem;

/// Shorthand for operations that abort the transaction on failure.
pub type TxResult<T> = Result<T, Aborted>;
