//! Verifier settings parsing.

use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings governing the consensus verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierSettings {
    /// Minimum number of executors that must agree on one hash.
    pub consensus_threshold: usize,
    /// How many executors to fan each build out to.
    pub total_executors: usize,
    /// Deadline for a session when the caller supplies none.
    pub default_timeout: Duration,
    /// Bound on retained terminal sessions.
    pub history_limit: usize,
    /// Requesters allowed to start or cancel verifications.
    /// Empty means no restriction.
    pub authorized_requesters: Vec<String>,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            consensus_threshold: 2,
            total_executors: 3,
            default_timeout: Duration::from_secs(1800),
            history_limit: 256,
            authorized_requesters: Vec::new(),
        }
    }
}

/// Parse verifier settings from KDL text.
///
/// ```kdl
/// verifier {
///     threshold 2
///     executors 3
///     timeout-secs 1800
///     history-limit 256
///     requesters "release-bot" "ops"
/// }
/// ```
pub fn parse_verifier_settings(text: &str) -> ConfigResult<VerifierSettings> {
    let doc: KdlDocument = text.parse()?;
    let mut settings = VerifierSettings::default();

    let verifier = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "verifier")
        .ok_or_else(|| ConfigError::MissingField("verifier block".to_string()))?;

    let Some(children) = verifier.children() else {
        return Ok(settings);
    };

    for child in children.nodes() {
        let first_int = || {
            child
                .entries()
                .iter()
                .find(|e| e.name().is_none())
                .and_then(|e| e.value().as_integer())
        };
        match child.name().value() {
            "threshold" => {
                let v = first_int().ok_or_else(|| ConfigError::InvalidValue {
                    field: "threshold".to_string(),
                    message: "expected an integer".to_string(),
                })?;
                if v < 1 {
                    return Err(ConfigError::InvalidValue {
                        field: "threshold".to_string(),
                        message: format!("must be at least 1, got {v}"),
                    });
                }
                settings.consensus_threshold = v as usize;
            }
            "executors" => {
                let v = first_int().ok_or_else(|| ConfigError::InvalidValue {
                    field: "executors".to_string(),
                    message: "expected an integer".to_string(),
                })?;
                if v < 1 {
                    return Err(ConfigError::InvalidValue {
                        field: "executors".to_string(),
                        message: format!("must be at least 1, got {v}"),
                    });
                }
                settings.total_executors = v as usize;
            }
            "timeout-secs" => {
                if let Some(v) = first_int() {
                    settings.default_timeout = Duration::from_secs(v.max(1) as u64);
                }
            }
            "history-limit" => {
                if let Some(v) = first_int() {
                    settings.history_limit = v.max(1) as usize;
                }
            }
            "requesters" => {
                settings.authorized_requesters = child
                    .entries()
                    .iter()
                    .filter(|e| e.name().is_none())
                    .filter_map(|e| e.value().as_string())
                    .map(String::from)
                    .collect();
            }
            _ => {}
        }
    }

    Ok(settings)
}
