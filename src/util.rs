use reqwest::Url;
use std::str::FromStr;

/// Parse "true"/"false"/"1"/"0" from a &str.
pub fn parse_bool_str(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// The variable's value, or `None` when unset or blank.
pub fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Parses `key`, falling back to `default` when unset or unparseable, then
/// clamps into `[min, max]`.
pub fn env_parse_clamped<T>(key: &str, default: T, min: T, max: T) -> T
where
    T: FromStr + Ord,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Returns true for localhost, loopback IPv4/IPv6, and 0.0.0.0 URLs.
pub fn is_local_endpoint_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return false;
    };

    match parsed.host_str() {
        Some(host) => {
            let normalized = host
                .trim()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_ascii_lowercase();
            normalized == "localhost"
                || normalized == "::1"
                || normalized == "0.0.0.0"
                || normalized.starts_with("127.")
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ENV_LOCK;

    #[test]
    fn test_parse_bool_str() {
        assert_eq!(parse_bool_str("true"), Some(true));
        assert_eq!(parse_bool_str("0"), Some(false));
        assert_eq!(parse_bool_str("YES"), Some(true));
        assert_eq!(parse_bool_str("off"), Some(false));
        assert_eq!(parse_bool_str("maybe"), None);
    }

    #[test]
    fn test_env_parse_clamped_falls_back_on_garbage() {
        let _env_lock = ENV_LOCK.blocking_lock();
        std::env::set_var("THREADLOOP_UTIL_TEST", "abc");
        assert_eq!(env_parse_clamped("THREADLOOP_UTIL_TEST", 7u32, 1, 10), 7);
        std::env::set_var("THREADLOOP_UTIL_TEST", " 99 ");
        assert_eq!(env_parse_clamped("THREADLOOP_UTIL_TEST", 7u32, 1, 10), 10);
        std::env::set_var("THREADLOOP_UTIL_TEST", "  ");
        assert_eq!(env_non_empty("THREADLOOP_UTIL_TEST"), None);
        std::env::remove_var("THREADLOOP_UTIL_TEST");
    }

    #[test]
    fn test_is_local_endpoint_url_normalizes_case_and_space() {
        assert!(is_local_endpoint_url(" HTTP://LOCALHOST:8000/v1/messages "));
        assert!(is_local_endpoint_url("https://127.0.0.1/v1/messages"));
        assert!(is_local_endpoint_url("https://0.0.0.0/v1/messages"));
        assert!(is_local_endpoint_url("http://[::1]:8000/v1/messages"));
        assert!(!is_local_endpoint_url(
            "https://evil-localhost.com/v1/messages"
        ));
        assert!(!is_local_endpoint_url(
            "https://api.anthropic.com/v1/messages"
        ));
    }
}
