//! KDL configuration parsing for Veribuild.
//!
//! This crate handles parsing of:
//! - Build instruction sets (structured pipelines or flat scripts)
//! - Verifier settings (consensus threshold, deadlines, history bounds)

pub mod error;
pub mod pipeline;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::parse_instruction_set;
pub use settings::{VerifierSettings, parse_verifier_settings};
