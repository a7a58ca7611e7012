// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Hash-to-scalar derivation for P-256.
//!
//! `SHA-256(parts...)` is interpreted as a big-endian integer and accepted only
//! if it lies in `[1, n-1]`. Rejected candidates are rehashed with a 4-byte
//! big-endian counter appended (`SHA-256(parts... || ctr)`, `ctr = 1, 2, ...`),
//! so no modulo bias is introduced. The first candidate needs no counter,
//! which keeps derivation identical to a plain `SHA-256(seed || path)` for
//! every input where that hash is already a valid scalar (all but ~2^-32).

use p256::elliptic_curve::PrimeField;
use p256::{FieldBytes, NonZeroScalar, Scalar};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Upper bound on rehash attempts. Each attempt fails with probability ~2^-32.
const MAX_ATTEMPTS: u32 = 64;

pub(crate) fn scalar_from_hash(parts: &[&[u8]]) -> Option<NonZeroScalar> {
    for counter in 0..MAX_ATTEMPTS {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        if counter > 0 {
            hasher.update(counter.to_be_bytes());
        }
        let mut candidate = Zeroizing::new([0u8; 32]);
        hasher.finalize_into(FieldBytes::from_mut_slice(candidate.as_mut_slice()));
        if let Some(scalar) = scalar_from_bytes(FieldBytes::from_slice(candidate.as_slice())) {
            return Some(scalar);
        }
    }
    None
}

/// Accept `bytes` as a scalar only if it is in `[1, n-1]`. Constant-time in
/// the value of `bytes`.
pub(crate) fn scalar_from_bytes(bytes: &FieldBytes) -> Option<NonZeroScalar> {
    let scalar: Option<Scalar> = Scalar::from_repr(*bytes).into();
    scalar.and_then(|s| NonZeroScalar::new(s).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_scalar() {
        let a = scalar_from_hash(&[b"seed", b"m/1"]).unwrap();
        let b = scalar_from_hash(&[b"seed", b"m/1"]).unwrap();
        assert_eq!(a.to_repr(), b.to_repr());
    }

    #[test]
    fn different_paths_differ() {
        let a = scalar_from_hash(&[b"seed", b"m/1"]).unwrap();
        let b = scalar_from_hash(&[b"seed", b"m/2"]).unwrap();
        assert_ne!(a.to_repr(), b.to_repr());
    }

    #[test]
    fn first_candidate_is_plain_sha256() {
        let digest = Sha256::digest(b"seedm/1");
        let scalar = scalar_from_hash(&[b"seed", b"m/1"]).unwrap();
        assert_eq!(scalar.to_repr(), digest);
    }

    #[test]
    fn out_of_range_bytes_are_rejected() {
        assert!(scalar_from_bytes(&FieldBytes::default()).is_none());
        assert!(scalar_from_bytes(&FieldBytes::from([0xff; 32])).is_none());

        let mut one = [0u8; 32];
        one[31] = 1;
        assert!(scalar_from_bytes(&FieldBytes::from(one)).is_some());
    }
}
