//! ferry
//!
//! Resumable transfer of large files between two filesystem trees through an
//! object store: compress and split at the origin, move the parts, rebuild at
//! the target. Every stage reconciles its own ledger against the target
//! inventory, so any run can be killed and simply started again.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod journal;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod scan;
pub mod stages;
pub mod store;

pub use error::{FerryError, Result};
