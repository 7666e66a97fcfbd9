//! notesync core: sync orchestration for ticket-to-note materialization.
//!
//! This crate owns *when* and *how* large, paginated ticket datasets are
//! pulled from an external tracker and turned into local note artifacts.
//! The actual query client, note writer, persistence layer, and notification
//! surface are injected as collaborator traits; see the [`sync`] module.

pub mod errors;
pub mod sync;

pub use errors::{Error, Result};
