#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotagate
//!
//! Distributed, rate-limited mutual exclusion for guarding creation of
//! scarce, per-subject, quota-limited resources, correct across any number
//! of stateless processes, with a shared key-value store as the only
//! coordination medium.
//!
//! ## Features
//!
//! - **Atomic quota counters** with calendar-aligned reset: the limit check
//!   and the increment are one indivisible store-side operation
//! - **Compensating refunds** that hand quota back when a creation fails
//!   downstream, without ever recreating an expired counter
//! - **Lease-based subject locks** with bounded wait, jittered backoff, and
//!   token-checked release, self-healing on holder crash
//! - **Fail-closed admission**: store faults reject the request instead of
//!   bypassing the quota
//! - **Pluggable backends**: in-memory store for tests and single-process
//!   use; Redis (Lua scripts) behind the `redis-store` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use quotagate::{CreationGate, MemoryStore, QuotaPolicy};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryStore::new());
//!     let gate = CreationGate::builder(store)
//!         .policy(QuotaPolicy::daily(3))
//!         .build();
//!
//!     let plan = gate
//!         .admit("user-42", || async {
//!             // Call the resource generator here.
//!             Ok::<_, std::io::Error>("plan-1")
//!         })
//!         .await;
//!     assert_eq!(plan.unwrap(), "plan-1");
//! }
//! ```
//!
//! ## What this crate does not promise
//!
//! The gap between "quota consumed" and "resource actually created" is not
//! atomic; the compensating refund only bounds the damage of a failed
//! attempt. There is no fairness among lock waiters, and no exactly-once
//! guarantee for the creation itself.

pub mod clock;
pub mod error;
pub mod gate;
pub mod lock;
pub mod quota;
pub mod store;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::GateError;
pub use gate::{CreationGate, GateBuilder};
pub use lock::{Acquisition, LockConfig, LockGuard, SubjectLock};
pub use quota::{QuotaCounter, QuotaDecision, QuotaPolicy, Refund};
pub use store::memory::MemoryStore;
pub use store::{CoordinationStore, KeySpace, StoreError};

#[cfg(feature = "redis-store")]
pub use store::redis::RedisStore;
