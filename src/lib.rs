//! Depot - caching proxy registry engine
//!
//! Resolves artifact requests against proxy and hosted repositories,
//! caching upstream payloads with explicit freshness, merging multi-version
//! metadata documents under optimistic concurrency, and keeping a
//! rebuildable browse tree of everything stored.

pub mod audit;
pub mod browse;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod format;
pub mod proxy;
pub mod repository;
pub mod store;
pub mod ui;
pub mod upstream;

pub use error::{DepotError, DepotResult};
