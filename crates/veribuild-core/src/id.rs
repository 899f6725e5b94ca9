//! Resource identifiers and build keys.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// A unique identifier for any resource in the system.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new unique ResourceId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Name of a build executor, assigned by the registry that manages
/// executor membership.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct ExecutorId(String);

impl ExecutorId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of one logical build: the (project, version) pair every
/// subsystem keys on. A duplicate key means the same build, never a new one.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{project_id}@{version}")]
pub struct BuildKey {
    pub project_id: String,
    pub version: String,
}

impl BuildKey {
    /// Create a build key, rejecting empty components.
    pub fn new(project_id: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let project_id = project_id.into();
        let version = version.into();
        if project_id.trim().is_empty() {
            return Err(Error::InvalidInput("project_id must not be empty".into()));
        }
        if version.trim().is_empty() {
            return Err(Error::InvalidInput("version must not be empty".into()));
        }
        Ok(Self {
            project_id,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_key_rejects_empty_components() {
        assert!(matches!(
            BuildKey::new("", "1.0.0"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            BuildKey::new("proj", "  "),
            Err(Error::InvalidInput(_))
        ));
        assert!(BuildKey::new("proj", "1.0.0").is_ok());
    }

    #[test]
    fn test_build_key_display() {
        let key = BuildKey::new("api-server", "v2.1").unwrap();
        assert_eq!(key.to_string(), "api-server@v2.1");
    }

    #[test]
    fn test_resource_ids_are_unique() {
        assert_ne!(ResourceId::new(), ResourceId::new());
    }
}
