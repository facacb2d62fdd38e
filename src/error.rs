//! Error types for the creation gate.

use crate::store::StoreError;
use std::fmt;
use std::time::Duration;

/// Unified error type returned by [`crate::CreationGate::admit`].
///
/// Quota exhaustion and lock contention are expected, frequent outcomes and
/// carry enough detail to surface "try again at/after" hints. Raw store
/// client errors never leak past this type.
#[derive(Debug, Clone)]
pub enum GateError<E> {
    /// The subject has used its full quota for the current period.
    QuotaExhausted {
        /// The configured per-period limit.
        limit: u32,
        /// Time until the period rolls over and the counter resets.
        resets_in: Duration,
    },
    /// The per-subject lock could not be acquired within the wait timeout.
    Busy {
        /// How long this caller waited before giving up.
        waited: Duration,
        /// The configured wait timeout.
        timeout: Duration,
    },
    /// The coordination store failed; the gate fails closed rather than
    /// risking a quota bypass.
    Store(StoreError),
    /// The creation side effect failed. Any quota consumed for the attempt
    /// has been refunded best-effort.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExhausted { limit, resets_in } => {
                write!(f, "quota of {} exhausted for this period (resets in {:?})", limit, resets_in)
            }
            Self::Busy { waited, timeout } => {
                write!(f, "subject busy: lock not acquired within {:?} (waited {:?})", timeout, waited)
            }
            Self::Store(err) => write!(f, "{}", err),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> GateError<E> {
    /// Check if this error is quota exhaustion.
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, Self::QuotaExhausted { .. })
    }

    /// Check if this error is lock contention.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Check if this error is a store fault.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Check if this error wraps a failure of the creation side effect.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access quota exhaustion info as (limit, resets_in).
    pub fn quota_details(&self) -> Option<(u32, Duration)> {
        match self {
            Self::QuotaExhausted { limit, resets_in } => Some((*limit, *resets_in)),
            _ => None,
        }
    }

    /// Access lock contention info as (waited, timeout).
    pub fn busy_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Busy { waited, timeout } => Some((*waited, *timeout)),
            _ => None,
        }
    }
}

impl<E> From<StoreError> for GateError<E> {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}
