//! # docket-core
//!
//! Core types, traits, and abstractions for the docket legal-document pipeline.
//!
//! This crate provides the data model shared by every other docket crate,
//! the error taxonomy, default constants, the repository / queue / service
//! trait seams, and the entity resolver that canonicalizes extracted mentions.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod resolver;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorKind, Result};
pub use models::*;
pub use resolver::{EntityResolver, Resolution, ResolverConfig};
pub use traits::*;
pub use uuid_utils::{
    canonical_entity_id, chunk_id, document_id_for, mention_id, new_v7, relationship_id,
};
