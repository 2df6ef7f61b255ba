//! Identity of a watched resource kind.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Core identity of an API resource family: group, version, and plural name.
///
/// One `Resource` identifies one watch stream; objects within it are told
/// apart by their `metadata.uid`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource {
    /// API group, empty for the core group
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Plural name used in API urls and CRD listings
    pub plural: String,
}

impl Resource {
    /// Construct from explicit group, version, and plural name
    pub fn new(group: &str, version: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
        }
    }

    /// The `apiVersion` string as objects carry it
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.plural, self.version)
        } else {
            write!(f, "{}.{}/{}", self.plural, self.group, self.version)
        }
    }
}
