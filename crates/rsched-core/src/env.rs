//! Environment variable utilities
//!
//! Typed `RSCHED_*` lookups with defaults, used by `SchedConfig::from_env`
//! and the logging setup.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// A set but unparsable value also yields the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (any case) are true, "0", "false", "no", "off"
/// are false. Unset or anything else returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
