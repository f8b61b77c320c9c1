//! Environment variable helpers
//!
//! Small typed accessors used for logging and runtime configuration
//! defaults (`STRAND_*` variables).

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable parsed as `T`, if set and parseable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Get an environment variable as a boolean
///
/// "1", "true", "yes", "on" (case-insensitive) count as true; anything
/// else, including unset, yields the default for unset and false for a
/// set-but-different value.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
