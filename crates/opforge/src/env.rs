//! Environment-driven knobs shared by the cache and the toolchains.

use std::env;
use std::path::PathBuf;

pub const MAX_PARALLEL_COMPILES: &str = "OPFORGE_MAX_PARALLEL_COMPILES";
pub const CACHE_DIR: &str = "OPFORGE_CACHE_DIR";
pub const KEEP_SOURCES: &str = "OPFORGE_KEEP_SOURCES";

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Returns the trimmed value of `key`, or `None` when unset or blank.
pub fn var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn var_bool(key: &str) -> Option<bool> {
    var(key).map(|value| parse_bool(&value))
}

pub fn var_usize(key: &str) -> Option<usize> {
    var(key).and_then(|value| value.parse().ok())
}

pub fn var_path(key: &str) -> Option<PathBuf> {
    var(key).map(PathBuf::from)
}

pub fn default_cache_dir() -> PathBuf {
    var_path(CACHE_DIR).unwrap_or_else(|| env::temp_dir().join("opforge_cache"))
}
