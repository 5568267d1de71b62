//! Rate-limit snapshots parsed from backend response headers.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Remaining quota as last reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub remaining: u64,
    pub limit: u64,
    pub reset: DateTime<Utc>,
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Parses `<prefix>remaining`, `<prefix>limit` and `<prefix>reset` (epoch
/// seconds). The first prefix with all three headers present wins.
pub fn parse_rate_limit(headers: &HeaderMap, prefixes: &[&str]) -> Option<RateLimitInfo> {
    prefixes.iter().find_map(|prefix| {
        let remaining = header_u64(headers, &format!("{prefix}remaining"))?;
        let limit = header_u64(headers, &format!("{prefix}limit"))?;
        let reset = header_u64(headers, &format!("{prefix}reset"))?;
        let reset = DateTime::from_timestamp(i64::try_from(reset).ok()?, 0)?;
        Some(RateLimitInfo {
            remaining,
            limit,
            reset,
        })
    })
}

/// `Retry-After` in seconds, when present and numeric.
pub fn retry_after(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, "retry-after")
}

/// Holds the most recent snapshot for one adapter instance.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    last: Mutex<Option<RateLimitInfo>>,
}

impl RateLimitTracker {
    pub fn observe(&self, headers: &HeaderMap, prefixes: &[&str]) {
        if let Some(info) = parse_rate_limit(headers, prefixes)
            && let Ok(mut last) = self.last.lock()
        {
            *last = Some(info);
        }
    }

    pub fn snapshot(&self) -> Option<RateLimitInfo> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}
