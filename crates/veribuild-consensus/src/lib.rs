//! Multi-executor consensus verification.
//!
//! Fans one logical build out to several independent executors, collects
//! their hash attestations under a deadline, and resolves Verified or
//! Failed by threshold agreement. A build is trusted only once enough
//! mutually-untrusted executors report the same artifact hash.

pub mod dispatch;
pub mod session;
pub mod verifier;

pub use dispatch::{BuildDispatcher, QueueDispatcher};
pub use session::{ExecutorResult, VerificationSession, VerificationStatus};
pub use verifier::ConsensusVerifier;
