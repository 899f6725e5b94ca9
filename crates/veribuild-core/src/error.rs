//! Error taxonomy shared by every Veribuild subsystem.
//!
//! Each public operation returns exactly one specific kind; `Internal` is the
//! catch-all and must be logged with context wherever it is constructed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or empty caller-supplied identifiers. Caller-fixable,
    /// never retried automatically.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced entity does not exist. Terminal for the call.
    #[error("not found: {0}")]
    NotFound(String),

    /// No instruction text stored for the requested (project, version).
    #[error("instructions not found: {0}")]
    InstructionsNotFound(String),

    /// Caller identity is not permitted. Must not leak internal state.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Queue or capacity limit reached. Caller should back off and retry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// One participating executor was unreachable or rejected dispatch.
    /// Reduces available attestations, never fails a whole session by itself.
    #[error("executor failure: {0}")]
    ExecutorFailure(String),

    /// All executors completed but no hash group reached the threshold.
    #[error("consensus failure: {0}")]
    ConsensusFailure(String),

    /// A deadline elapsed. Partial results remain exposed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Detected tampering or an attestation from a non-participant.
    /// Logged distinctly from ordinary failures.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
