//! Cache policy: classify entries and compute expiry times

use crate::store::model::CacheEntry;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Classification of a cache entry at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// No entry has ever been recorded
    Missing,
    /// Positive entry within its lifetime
    Fresh,
    /// Negative entry within its lifetime; absence is still confirmed
    FreshNegative,
    /// Entry past its lifetime, positive or negative
    Stale,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Fresh => write!(f, "fresh"),
            Self::FreshNegative => write!(f, "fresh-negative"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Classify `entry` at `now`
pub fn classify(entry: Option<&CacheEntry>, now: DateTime<Utc>) -> Freshness {
    match entry {
        None => Freshness::Missing,
        Some(entry) if now > entry.expires_at => Freshness::Stale,
        Some(entry) if entry.is_negative => Freshness::FreshNegative,
        Some(_) => Freshness::Fresh,
    }
}

/// Entry lifetimes for one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    /// Content such as tarballs and jars
    pub content: Duration,
    /// Metadata such as package roots and indexes
    pub metadata: Duration,
    /// Confirmed upstream absence
    pub negative: Duration,
}

impl CacheTtls {
    pub fn from_secs(content: u64, metadata: u64, negative: u64) -> Self {
        Self {
            content: secs(content),
            metadata: secs(metadata),
            negative: secs(negative),
        }
    }

    /// Expiry of a positive entry stored at `now`
    pub fn positive_expiry(&self, now: DateTime<Utc>, is_metadata: bool) -> DateTime<Utc> {
        let ttl = if is_metadata {
            self.metadata
        } else {
            self.content
        };
        now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Expiry of a negative entry stored at `now`
    pub fn negative_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.negative)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self::from_secs(24 * 60 * 60, 30 * 60, 60 * 60)
    }
}

/// Lifetimes are capped at `u32::MAX` seconds (about 136 years)
fn secs(value: u64) -> Duration {
    Duration::seconds(i64::from(u32::try_from(value).unwrap_or(u32::MAX)))
}
