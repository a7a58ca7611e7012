// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Cross-component error taxonomy.
//!
//! Every component owns its own `thiserror` enum. This module only defines
//! the coarse [`ErrorKind`] each of them maps onto, so callers can apply one
//! retry/abort policy regardless of which component failed.
//!
//! | Kind | Meaning | Caller policy |
//! |------|---------|---------------|
//! | `Transient` | Network or coordinator hiccup | Retry (activation does this internally) |
//! | `Permanent` | Cancellation, deadline, malformed response | Surface immediately |
//! | `NotFound` | Unknown secret or handle | Caller decides |
//! | `SealingFailure` | Hardware runtime malfunction | Log and surface |
//! | `InvalidInput` | Bad length, checksum, digest size | Reject, no side effects |

use std::fmt;

use serde::Serialize;

/// Coarse classification shared by all component errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    NotFound,
    SealingFailure,
    InvalidInput,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may succeed if repeated.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::NotFound => "not_found",
            ErrorKind::SealingFailure => "sealing_failure",
            ErrorKind::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::SealingFailure.is_retryable());
        assert!(!ErrorKind::InvalidInput.is_retryable());
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SealingFailure).unwrap();
        assert_eq!(json, r#""sealing_failure""#);
        assert_eq!(ErrorKind::InvalidInput.to_string(), "invalid_input");
    }
}
