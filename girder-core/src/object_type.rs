//! Object kinds for file-system objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a file-system object referenced by a known artifact.
///
/// The wire encoding is the single-letter form used in artifact
/// descriptions and cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "x")]
    Executable,
    #[serde(rename = "t")]
    Tree,
    #[serde(rename = "l")]
    Symlink,
}

impl ObjectType {
    /// The single-letter wire encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::File => "f",
            ObjectType::Executable => "x",
            ObjectType::Tree => "t",
            ObjectType::Symlink => "l",
        }
    }

    /// Parse the single-letter wire encoding.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "f" => Some(ObjectType::File),
            "x" => Some(ObjectType::Executable),
            "t" => Some(ObjectType::Tree),
            "l" => Some(ObjectType::Symlink),
            _ => None,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, ObjectType::Tree)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, ObjectType::Symlink)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
