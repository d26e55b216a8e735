//! Environment variable helpers for configuration overrides
//!
//! ```ignore
//! use chanpool_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let managers: usize = env_get("CHANPOOL_NUM_MANAGERS", 4);
//! let keep_alive = env_get_bool("CHANPOOL_KEEP_ALIVE", false);
//! let timeout = env_get_millis("CHANPOOL_READ_TIMEOUT_MS"); // Option<Duration>
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or malformed.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, "0",
/// "false", "no", "off" are false, anything else keeps `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Milliseconds as a `Duration`. Zero reads as "disabled" (`None`).
pub fn env_get_millis(key: &str) -> Option<Duration> {
    env_get_opt::<u64>(key)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
