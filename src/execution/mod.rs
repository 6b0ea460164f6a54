//! Execution module: hedged, bounded attempts for one logical read.
//!
//! ```text
//!            candidates (selector order)
//!                  │
//!   Pending ──► Racing ──────────────────────────────► Succeeded
//!                  │  launch c0                          ▲
//!                  │  hedge delay / retryable failure    │ first success
//!                  │  ──► launch next (≤ max in flight)  │ (earliest candidate
//!                  │                                     │  among finished ones)
//!                  └── deadline / terminal error / cancel ──► Failed
//! ```
//!
//! Retryable attempt failures (transport faults, replicas that no longer
//! serve the version) move on to the next candidate and demote the failing
//! instance in the selector. A missing key is an answer, not a failure.

mod attempt;
mod coordinator;

pub use attempt::AttemptError;
pub use coordinator::{ExecutionCoordinator, ReadRequest, RequestState};
