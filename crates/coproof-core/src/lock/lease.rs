//! Lease arithmetic. Time is always passed in explicitly.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A held (or previously held) lease on one lock key.
///
/// `deadline_ms == 0` marks a released lease; the fencing token survives
/// release so the next holder still gets a strictly larger one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub holder: String,
    pub fencing_token: u64,
    pub deadline_ms: u64,
}

impl Lease {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        is_lease_expired(self.deadline_ms, now_ms)
    }
}

pub fn next_fencing_token(current: Option<&Lease>) -> u64 {
    current.map_or(1, |lease| lease.fencing_token.saturating_add(1))
}

pub fn lease_deadline(now_ms: u64, ttl_ms: u64) -> u64 {
    now_ms.saturating_add(ttl_ms)
}

pub fn is_lease_expired(deadline_ms: u64, now_ms: u64) -> bool {
    deadline_ms == 0 || now_ms > deadline_ms
}

pub fn remaining_ttl_ms(deadline_ms: u64, now_ms: u64) -> u64 {
    deadline_ms.saturating_sub(now_ms)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| duration_ms(elapsed))
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
