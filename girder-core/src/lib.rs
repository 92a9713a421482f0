//! GIRDER Core - Content-Addressed Build Primitives
//!
//! Core data types shared by the GIRDER build engine: cryptographic
//! digests, object types, artifact and action descriptions, synthesized
//! trees, and the path discipline used throughout analysis.

pub mod action;
pub mod artifact;
pub mod config_merge;
pub mod hash;
pub mod object_type;
pub mod path;
pub mod tree;

pub use action::{ActionDescription, ActionError};
pub use artifact::{ArtifactDescription, ArtifactError, ObjectInfo};
pub use config_merge::merge_on_top;
pub use hash::{compute_hash, Digest, Hasher};
pub use object_type::ObjectType;
pub use tree::Tree;
