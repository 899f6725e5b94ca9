//! Stage execution backends for Veribuild.
//!
//! Provides the runner implementations the scheduler drives:
//! - Local process runner (shell commands in a throwaway workspace)

pub mod process;

pub use process::ProcessRunner;
pub use veribuild_core::{StageContext, StageOutput, StageRunner};
