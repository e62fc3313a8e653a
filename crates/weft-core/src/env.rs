//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing configuration overrides with defaults.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default
///
/// Works with any `FromStr` type; unset or unparsable values fall back to
/// the default.
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

/// Get an environment variable as a boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true; everything
/// else set counts as false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get an environment variable as an optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__WEFT_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<u64> = env_get_opt("__WEFT_TEST_UNSET__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_bool() {
        assert!(env_get_bool("__WEFT_TEST_UNSET__", true));
        assert!(!env_get_bool("__WEFT_TEST_UNSET__", false));

        std::env::set_var("__WEFT_TEST_BOOL__", "yes");
        assert!(env_get_bool("__WEFT_TEST_BOOL__", false));
        std::env::set_var("__WEFT_TEST_BOOL__", "garbage");
        assert!(!env_get_bool("__WEFT_TEST_BOOL__", true));
        std::env::remove_var("__WEFT_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__WEFT_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__WEFT_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__WEFT_TEST_INVALID__");
    }
}
