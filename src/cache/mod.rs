//! Cache freshness decisions
//!
//! Decides whether a cached entry can be served as-is, must be revalidated
//! against upstream, or does not exist yet. Nothing in here performs I/O.
//!
//! # Freshness
//!
//! | State | Entry | Engine action |
//! |-------|-------|---------------|
//! | Missing | none | fetch upstream |
//! | Fresh | positive, `now <= expires_at` | serve cached payload |
//! | FreshNegative | negative, `now <= expires_at` | answer not found |
//! | Stale | either kind, `now > expires_at` | conditional fetch upstream |

pub mod policy;

pub use policy::{classify, CacheTtls, Freshness};
