//! Core types and traits for the shrtnr link-storage engine.
//!
//! This crate provides the shared vocabulary used by every storage backend
//! and by the callers in front of them: the [`LinkStore`] contract, the
//! [`ShortCode`] identifier and the storage error taxonomy.

pub mod error;
pub mod link;
pub mod shortcode;
pub mod store;

pub use error::{Result, StorageError};
pub use link::{BatchEntry, BatchOutcome, Link, UrlRecord};
pub use shortcode::ShortCode;
pub use store::LinkStore;
