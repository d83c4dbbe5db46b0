// Copyright 2015-2018 rust-stm Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::atomic::{AtomicU64, Ordering};

/// The most significant bit of the lock word holds the lock flag.
const LOCK_BIT: u64 = 1 << 63;

/// The remaining 63 bits hold the version.
const VERSION_MASK: u64 = LOCK_BIT - 1;

/// A snapshot of a versioned lock, split into its two fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSample {
    pub locked: bool,
    pub version: u64,
}

/// The atomic primitive guarding a single shared word.
///
/// One `AtomicU64` packs a lock bit and a 63 bit version. The version
/// records the commit timestamp of the last write to the guarded word;
/// the lock bit is set only between the lock acquisition and lock release
/// phases of a commit.
pub struct VersionedLock {
    state: AtomicU64,
}

impl VersionedLock {
    /// A fresh lock: unlocked, version zero.
    pub fn new() -> VersionedLock {
        VersionedLock {
            state: AtomicU64::new(0),
        }
    }

    /// Atomically observe both fields.
    pub fn sample(&self) -> LockSample {
        split(self.state.load(Ordering::Acquire))
    }

    /// Try to set the lock bit. Fails if the lock is already held.
    ///
    /// There is no waiting here. On failure the committing transaction
    /// rolls back and the caller retries with a fresh transaction.
    pub fn try_acquire(&self) -> bool {
        let current = self.state.load(Ordering::Relaxed);
        if current & LOCK_BIT != 0 {
            return false;
        }
        self.state
            .compare_exchange(
                current,
                current | LOCK_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Clear the lock bit and leave the version untouched.
    ///
    /// Used to roll back a partially acquired write set.
    pub fn release(&self) {
        let current = self.state.load(Ordering::Relaxed);
        debug_assert!(current & LOCK_BIT != 0, "releasing an unlocked word");
        self.state.store(current & VERSION_MASK, Ordering::Release);
    }

    /// Clear the lock bit and publish `version` in the same store.
    ///
    /// The release ordering makes a committed write visible: a reader
    /// that samples the new version afterwards also sees every payload
    /// byte stored before this call.
    pub fn release_at(&self, version: u64) {
        assert!(version & LOCK_BIT == 0, "version clock overflowed 63 bits");
        debug_assert!(
            self.state.load(Ordering::Relaxed) & LOCK_BIT != 0,
            "releasing an unlocked word"
        );
        self.state.store(version, Ordering::Release);
    }
}

fn split(word: u64) -> LockSample {
    LockSample {
        locked: word & LOCK_BIT != 0,
        version: word & VERSION_MASK,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_unlocked_at_version_zero() {
        let lock = VersionedLock::new();
        let sample = lock.sample();

        assert!(!sample.locked);
        assert_eq!(sample.version, 0);
    }

    #[test]
    fn acquire_sets_the_lock_bit() {
        let lock = VersionedLock::new();

        assert!(lock.try_acquire());
        let sample = lock.sample();
        assert!(sample.locked);
        // The version does not move on acquisition.
        assert_eq!(sample.version, 0);
    }

    #[test]
    fn acquire_fails_while_held() {
        let lock = VersionedLock::new();

        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
    }

    #[test]
    fn release_keeps_the_version() {
        let lock = VersionedLock::new();
        lock.try_acquire();
        lock.release_at(7);

        lock.try_acquire();
        lock.release();

        let sample = lock.sample();
        assert!(!sample.locked);
        assert_eq!(sample.version, 7);
    }

    #[test]
    fn versioned_release_publishes() {
        let lock = VersionedLock::new();
        lock.try_acquire();
        lock.release_at(42);

        let sample = lock.sample();
        assert!(!sample.locked);
        assert_eq!(sample.version, 42);

        // The lock is usable again afterwards.
        assert!(lock.try_acquire());
    }
}
