//! Centralized environment-variable parsing helpers.
//!
//! All feature-toggle and tuning-knob env-var reads should go through these
//! helpers so the truthy/falsey parsing logic lives in exactly one place.

/// Forces the blit backend even when desktop duplication is available.
pub(crate) const FORCE_BLIT_VAR: &str = "CAPTAIN_FORCE_BLIT";
/// Overrides the per-attempt duplication acquire timeout, in milliseconds.
pub(crate) const ACQUIRE_TIMEOUT_VAR: &str = "CAPTAIN_ACQUIRE_TIMEOUT_MS";
/// Overrides how many empty-metadata frames are skipped before giving up.
pub(crate) const MAX_EMPTY_FRAMES_VAR: &str = "CAPTAIN_MAX_EMPTY_FRAMES";
/// Path to the ffmpeg binary used by the H.264/H.265 codecs.
pub(crate) const FFMPEG_PATH_VAR: &str = "CAPTAIN_FFMPEG_PATH";

/// Returns `true` when the environment variable is set to a truthy value
/// (`1`, `true`, `yes`, or `on`, case-insensitive, trimmed).
#[inline]
pub(crate) fn env_var_truthy(var_name: &str) -> bool {
    std::env::var(var_name)
        .map(|raw| is_truthy(&raw))
        .unwrap_or(false)
}

fn is_truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
}

/// Parses the environment variable as a `u64`, returning `Some` only when
/// the value is a valid positive (> 0) integer.
#[inline]
pub(crate) fn env_var_positive_u64(var_name: &str) -> Option<u64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| parse_positive(&raw))
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|value| *value > 0)
}

/// Returns the environment variable as a path when it is set and non-empty.
pub(crate) fn env_var_path(var_name: &str) -> Option<std::path::PathBuf> {
    std::env::var_os(var_name)
        .filter(|raw| !raw.is_empty())
        .map(std::path::PathBuf::from)
}

/// Declares a cached boolean feature flag backed by a `OnceLock<bool>`.
///
/// `enabled_when(fn_name, "ENV_VAR")` returns `true` only when the env var
/// is truthy, so the feature is off by default.
macro_rules! define_env_flag {
    (enabled_when($fn_name:ident, $var:expr)) => {
        #[inline]
        fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| $crate::env_config::env_var_truthy($var))
        }
    };
}

pub(crate) use define_env_flag;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values_are_normalized() {
        assert!(is_truthy(" YES "));
        assert!(is_truthy("on"));
        assert!(is_truthy("1"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("off"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn positive_parse_rejects_zero_and_garbage() {
        assert_eq!(parse_positive(" 250 "), Some(250));
        assert_eq!(parse_positive("0"), None);
        assert_eq!(parse_positive("-3"), None);
        assert_eq!(parse_positive("fast"), None);
    }

    #[test]
    fn unset_variables_fall_back() {
        let name = "CAPTAIN_TEST_VARIABLE_THAT_IS_NEVER_SET";
        assert!(!env_var_truthy(name));
        assert_eq!(env_var_positive_u64(name), None);
        assert_eq!(env_var_path(name), None);
    }
}
