//! Environment overrides for `LinkConfig`.
//!
//! ```ignore
//! use shmlink_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let pct: u8 = env_get("SHMLINK_HIGH_WATER_PCT", 75);
//! let iosm = env_get_bool("SHMLINK_IOSM", false);
//! let wait = env_get_ms("SHMLINK_RES_ACK_WAIT_MS", Duration::from_millis(10));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
///
/// Accepts a `0x` prefix for integer types so register-style values
/// (`SHMLINK_BUSY_COUNT_MASK=0xF`) can be written the way they are documented.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr + TryFrom<u64>,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|v| T::try_from(v).ok())
            .unwrap_or(default);
    }
    raw.parse().unwrap_or(default)
}

/// Boolean: "1", "true", "yes", "on" (case-insensitive) are true.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Milliseconds, returned as a `Duration`.
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_get(key, default.as_millis() as u64))
}

/// String value (link names).
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__SHMLINK_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__SHMLINK_TEST_UNSET__", true));
        assert_eq!(env_get_str("__SHMLINK_TEST_UNSET__", "mif"), "mif");
    }

    #[test]
    fn test_env_get_hex() {
        std::env::set_var("__SHMLINK_TEST_HEX__", "0xF");
        let val: u32 = env_get("__SHMLINK_TEST_HEX__", 0);
        assert_eq!(val, 15);
        std::env::set_var("__SHMLINK_TEST_HEX__", "0x1FF");
        let narrow: u8 = env_get("__SHMLINK_TEST_HEX__", 7);
        assert_eq!(narrow, 7); // does not fit, default kept
        std::env::remove_var("__SHMLINK_TEST_HEX__");
    }

    #[test]
    fn test_env_get_ms() {
        std::env::set_var("__SHMLINK_TEST_MS__", "25");
        let d = env_get_ms("__SHMLINK_TEST_MS__", Duration::from_millis(1));
        assert_eq!(d, Duration::from_millis(25));
        std::env::set_var("__SHMLINK_TEST_MS__", "soon");
        let d = env_get_ms("__SHMLINK_TEST_MS__", Duration::from_millis(1));
        assert_eq!(d, Duration::from_millis(1));
        std::env::remove_var("__SHMLINK_TEST_MS__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__SHMLINK_TEST_BOOL__", v);
            assert!(env_get_bool("__SHMLINK_TEST_BOOL__", false), "{}", v);
        }
        for v in ["0", "false", "garbage"] {
            std::env::set_var("__SHMLINK_TEST_BOOL__", v);
            assert!(!env_get_bool("__SHMLINK_TEST_BOOL__", true), "{}", v);
        }
        std::env::remove_var("__SHMLINK_TEST_BOOL__");
    }
}
