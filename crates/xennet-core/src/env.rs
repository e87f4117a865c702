//! Environment variable helpers for `XENNET_*` overrides.
//!
//! ```ignore
//! use xennet_core::env::{env_get, env_get_bool};
//!
//! let target: u32 = env_get("XENNET_RX_TARGET", 256);
//! let sg = env_get_bool("XENNET_SG", true);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`. `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1"/"true"/"yes"/"on" and "0"/"false"/"no"/"off"
/// (case-insensitive). Anything else, including unset, is `default`.
#[inline]
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default_when_unset() {
        let val: u32 = env_get("__XENNET_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u32>("__XENNET_TEST_UNSET__").is_none());
    }

    #[test]
    fn test_env_get_parses_and_trims() {
        std::env::set_var("__XENNET_TEST_NUM__", " 123 ");
        let val: usize = env_get("__XENNET_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__XENNET_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_falls_back() {
        std::env::set_var("__XENNET_TEST_BAD__", "lots");
        let val: u16 = env_get("__XENNET_TEST_BAD__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__XENNET_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__XENNET_TEST_BOOL__", "ON");
        assert!(env_get_bool("__XENNET_TEST_BOOL__", false));
        std::env::set_var("__XENNET_TEST_BOOL__", "no");
        assert!(!env_get_bool("__XENNET_TEST_BOOL__", true));
        std::env::set_var("__XENNET_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__XENNET_TEST_BOOL__", true));
        assert!(!env_get_bool("__XENNET_TEST_BOOL__", false));
        std::env::remove_var("__XENNET_TEST_BOOL__");
    }
}
