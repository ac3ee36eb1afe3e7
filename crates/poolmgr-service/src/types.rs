//! Resource definitions as they are stored by the metadata store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Uniquely addresses one version of a resource.
///
/// Two identities are only equal if both `name` and `uid` match, so different versions of the
/// same function never share cached state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
        }
    }

    /// Whether this identity pins an exact version.
    ///
    /// An identity without `uid` is never interpreted as "latest".
    pub fn is_versioned(&self) -> bool {
        !self.uid.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.uid)
    }
}

/// Resource limits applied to every instance of an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
}

/// A language runtime that functions are specialized into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub metadata: Identity,
    /// The container image that warm instances of this environment run.
    #[serde(rename = "runContainerImageUrl", alias = "image")]
    pub image: String,
    #[serde(default)]
    pub resources: ResourceLimits,
}

/// Where to fetch the code of a function from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRef {
    pub url: String,
}

/// A function definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub metadata: Identity,
    pub environment: Identity,
    /// An explicit package location.
    ///
    /// If this is missing, the package is served by the metadata store itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageRef>,
}
