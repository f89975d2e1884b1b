//! Robust authentication bootstrap.
//!
//! Provides:
//! - Session restore at start-up, bounded by per-call timeouts
//! - A small explicit retry budget, then a forced clean slate
//! - Sign-in, sign-up, sign-out and password actions with classified errors
//! - A durable "remember me" flag that gates session restore
//!
//! ## Design Decisions
//! - State is published as immutable snapshots over `tokio::sync::watch`;
//!   observers never see a half-applied transition.
//! - Late results from abandoned operations are dropped by cancellation
//!   scope, not by checking a liveness flag after the fact.
//! - Errors reaching this layer are already classified by the backend
//!   adapter; the machine only branches on `ErrorKind`.

pub mod machine;
pub mod preference;
pub mod session;

pub use machine::{AuthMachine, RetryOutcome};
pub use preference::{FilePreferenceStore, PreferenceStore, REMEMBER_ME_FILE};
pub use session::{AuthSession, Phase};
