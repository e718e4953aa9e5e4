//! pdfscope — content-addressed passage retrieval over PDF-derived text.
//!
//! The service answers free-form questions with ranked, source-attributed
//! passages from a collection of extracted-text documents. Indices are
//! content-addressed by source fingerprint, cached in memory by path, and
//! queryable either as one merged collection over HTTP or as parallel
//! fan-out across many per-document indices.

pub mod aggregate;
pub mod api;
pub mod builder;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod embed;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod reclaim;
pub mod store;

pub use error::{Error, Result};
