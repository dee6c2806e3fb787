//! Merge image records harvested from several collections into one
//! deduplicated corpus, grouped by visual similarity and split into
//! train/val/test/holdout without leaking look-alike images across splits.
//!
//! All stages work on in-memory collections; the whole metadata set for a
//! run has to fit in memory.

pub mod config;
pub mod core;
pub mod error;

pub use config::MergerConfig;
pub use error::{MergeError, Result};
