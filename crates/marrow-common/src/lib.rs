//! MarrowDB common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all MarrowDB
//! components.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{MarrowError, Result};
pub use types::{Lsn, PageId, Rid, Tuple, TxnId, PAGE_SIZE};
