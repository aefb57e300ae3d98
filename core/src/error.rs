//! Error-kind taxonomy shared by every component.
//!
//! Components keep their own `thiserror` enums. What they share is the
//! *kind* of failure, which decides how the failure travels:
//!
//! | Kind | Retried inside component | Edge mapping |
//! |------|--------------------------|--------------|
//! | [`ErrorKind::Precondition`] | never | 400 / 422 |
//! | [`ErrorKind::NotFound`] | never | 404 |
//! | [`ErrorKind::Conflict`] | never | 409 |
//! | [`ErrorKind::Entitlement`] | never | 402 / 429 |
//! | [`ErrorKind::Transient`] | bounded backoff | 503 |
//! | [`ErrorKind::Permanent`] | never (triggers compensation) | 502 |
//! | [`ErrorKind::Invariant`] | treated as transient locally | 500 |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failure, independent of the component that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input, invalid station range, expired hold, passenger mismatch.
    Precondition,
    /// The referenced hold, booking, order or saga does not exist.
    NotFound,
    /// Seat not available, too many holds, duplicate in-flight request.
    Conflict,
    /// Quota exceeded or no active subscription.
    Entitlement,
    /// Network, 5xx or timeout from a provider, cache, store or log.
    Transient,
    /// Signature mismatch, refused payment, rejected identity.
    Permanent,
    /// Cache corruption, row missing where a conditional update expected it.
    Invariant,
}

impl ErrorKind {
    /// Returns true when a bounded retry may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Invariant)
    }

    /// Stable lowercase name, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Entitlement => "entitlement",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Invariant => "invariant",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every component error so callers can route on kind.
pub trait Classify {
    /// The kind of this failure.
    fn kind(&self) -> ErrorKind;

    /// Shorthand for `self.kind().is_retryable()`.
    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
