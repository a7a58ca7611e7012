// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Plaintext buffer that scrubs itself on drop.

use std::fmt;
use std::ops::{Deref, DerefMut};

use zeroize::Zeroize;

/// Owned plaintext bytes that are overwritten with zeros when dropped.
///
/// Drop runs on every exit path, including early `?` returns and unwinding
/// out of a panicking closure, which is what the vault relies on to keep
/// plaintext from outliving the call that unsealed it.
pub struct SecretBuffer {
    bytes: Vec<u8>,
}

impl SecretBuffer {
    /// Take ownership of `bytes`. The caller must not keep other copies.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Copy `bytes` into a new buffer.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Deref for SecretBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for SecretBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuffer([REDACTED; {}])", self.bytes.len())
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.bytes.as_mut_slice().zeroize();
        #[cfg(test)]
        scrub_probe::record(self.bytes.iter().all(|b| *b == 0));
        // Clears spare capacity and truncates.
        self.bytes.zeroize();
    }
}

/// Test-only observation of buffer drops on the current thread.
#[cfg(test)]
pub(crate) mod scrub_probe {
    use std::cell::Cell;

    thread_local! {
        static SCRUBBED: Cell<usize> = const { Cell::new(0) };
        static DIRTY: Cell<usize> = const { Cell::new(0) };
    }

    pub(crate) fn record(all_zero: bool) {
        if all_zero {
            SCRUBBED.with(|c| c.set(c.get() + 1));
        } else {
            DIRTY.with(|c| c.set(c.get() + 1));
        }
    }

    /// `(scrubbed, dirty)` drop counts observed so far on this thread.
    pub(crate) fn snapshot() -> (usize, usize) {
        (SCRUBBED.with(Cell::get), DIRTY.with(Cell::get))
    }
}
