//! ICAT Core Library
//!
//! This crate provides the transport-independent parts of the ICAT client:
//! - The typed error shared by every operation
//! - Streaming JSON value extraction for small known-shape responses
//! - The bulk-metadata ("port file") codec used by export and import
//! - Structured query types for the text-search index

pub mod error;
pub mod jsonstream;
pub mod portfile;
pub mod search;

// Re-export commonly used types
pub use error::{ErrorKind, IcatError, Result};
pub use portfile::{AttributeScope, Document, DuplicateAction, Entity, Literal};
pub use search::{ParameterValue, SearchParameter, SearchQuery};
