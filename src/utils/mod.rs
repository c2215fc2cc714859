//! Common utilities and helper functions

pub mod retry;

use std::time::Duration;

/// Current wall-clock time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Absolute expiry for a relative TTL; `None` means never
pub fn expiry_ms(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now.saturating_add(ttl.as_millis() as i64))
}

/// Short, human-readable name of a type (`my_crate::errors::Boom` → `Boom`)
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
