//! ICAT Client Library
//!
//! HTTP client for the RESTful API of an ICAT metadata catalog server.
//! An [`Icat`] value represents one server; logging in yields a
//! [`Session`] exposing the catalog operations. The bulk metadata format
//! used by export and import is implemented in [`icat_core::portfile`].

mod client;
mod session;

pub use client::Icat;
pub use session::{DataSearch, MetadataExport, Session};

pub use icat_core::search::{ParameterValue, SearchParameter, SearchQuery};
pub use icat_core::{AttributeScope, DuplicateAction, ErrorKind, IcatError, Result};
