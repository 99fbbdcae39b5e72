//! Typed environment-variable lookups with fallback, in the style of
//! `telemetry-adapters::f1::parse_u16_env`: read, parse, validate, fall back.

use std::path::PathBuf;
use std::str::FromStr;

/// Parse `name` from the environment into `T`, falling back to `fallback` if the
/// variable is unset or fails to parse.
pub fn parse_env<T: FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(fallback)
}

/// Parse `name` from the environment into `T`, falling back to `fallback` if unset,
/// unparsable, or rejected by `validate`.
pub fn parse_env_validated<T: FromStr>(name: &str, fallback: T, validate: impl Fn(&T) -> bool) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(validate)
        .unwrap_or(fallback)
}

/// Parse `name` as a boolean flag: `"1"`/`"true"`/`"yes"` (case-insensitive) are
/// truthy, everything else (including unset) falls back to `fallback`.
#[must_use]
pub fn parse_bool_env(name: &str, fallback: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => fallback,
    }
}

/// Read `name` as a required string, returning `None` if unset or empty.
#[must_use]
pub fn required_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Read `name` as a path, falling back to `fallback` if unset.
#[must_use]
pub fn parse_path_env(name: &str, fallback: &str) -> PathBuf {
    std::env::var(name).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(fallback))
}
