//! Configuration loading from environment variables.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Runtime configuration for the store and its maintenance operations.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_path: String,
    /// Audit drift percentage above which callers should schedule a rebuild.
    pub drift_threshold_pct: f64,
    /// Maximum per-bucket shrink tolerated before a rebuild refuses to swap.
    pub rebuild_tolerance_pct: f64,
    /// TTL for per-entity write locks.
    pub write_lock_ttl_ms: u64,
    /// TTL for the advisory rebuild/maintenance lock.
    pub rebuild_lock_ttl_ms: u64,
    /// Number of live documents sampled during gap detection.
    pub audit_sample_size: usize,
    /// Retired index generations retained before their buckets are pruned.
    pub backup_retention: usize,
    /// Snapshot the database file before destructive maintenance.
    pub auto_backup: bool,
    /// TTL for the read-through entity cache.
    pub cache_ttl_ms: u64,
    /// Maximum entries held by the read-through entity cache.
    pub cache_capacity: usize,
}

/// Expand tilde (~) in paths to the user's home directory
fn expand_tilde(path: String) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = resolve_home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path
}

fn resolve_home_dir() -> Option<PathBuf> {
    if let Ok(home) = env::var("HOME") {
        if !home.trim().is_empty() {
            return Some(PathBuf::from(home));
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.trim().is_empty() {
            return Some(PathBuf::from(profile));
        }
    }

    std::env::current_dir().ok()
}

/// Parse a boolean-like environment flag value.
///
/// # Supported Values
/// - Truthy: `1`, `true`, `yes`, `on`
/// - Falsy: `0`, `false`, `no`, `off`, empty string
///
/// Matching is case-insensitive and ignores surrounding whitespace.
///
/// # Returns
/// `Some(bool)` when the value is recognized, otherwise `None`.
pub fn parse_env_flag(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read a boolean flag from the environment.
///
/// Missing or unrecognized values are treated as `false`.
///
/// # Arguments
/// - `name`: Environment variable name.
///
/// # Returns
/// `true` when the value is a recognized truthy value.
pub fn env_flag_enabled(name: &str) -> bool {
    env::var(name)
        .ok()
        .and_then(|value| parse_env_flag(&value))
        .unwrap_or(false)
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Returns
    /// A populated [`Config`] with defaults applied when env vars are missing.
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("KOLBASE_DB_PATH")
                .map(expand_tilde)
                .unwrap_or_else(|_| {
                    let home = resolve_home_dir().unwrap_or_else(|| PathBuf::from("."));
                    let cache_dir = home.join(".cache").join("kolbase");
                    cache_dir.join("db").to_string_lossy().to_string()
                }),
            drift_threshold_pct: env_parsed("KOLBASE_DRIFT_THRESHOLD_PCT", 2.0),
            rebuild_tolerance_pct: env_parsed("KOLBASE_REBUILD_TOLERANCE_PCT", 5.0),
            write_lock_ttl_ms: env_parsed("KOLBASE_WRITE_LOCK_TTL_MS", 5_000),
            rebuild_lock_ttl_ms: env_parsed("KOLBASE_REBUILD_LOCK_TTL_MS", 60_000),
            audit_sample_size: env_parsed("KOLBASE_AUDIT_SAMPLE_SIZE", 500),
            backup_retention: env_parsed("KOLBASE_BACKUP_RETENTION", 2),
            auto_backup: env_flag_enabled("KOLBASE_AUTO_BACKUP"),
            cache_ttl_ms: env_parsed("KOLBASE_CACHE_TTL_MS", 5_000),
            cache_capacity: env_parsed("KOLBASE_CACHE_CAPACITY", 1_024),
        }
    }

    /// Configuration suitable for tests: tight TTLs, small samples.
    ///
    /// # Arguments
    /// - `db_path`: Database path (usually inside a temp dir).
    ///
    /// # Returns
    /// A [`Config`] that does not consult the environment.
    pub fn for_tests(db_path: &str) -> Self {
        Self {
            db_path: db_path.to_string(),
            drift_threshold_pct: 2.0,
            rebuild_tolerance_pct: 5.0,
            write_lock_ttl_ms: 2_000,
            rebuild_lock_ttl_ms: 10_000,
            audit_sample_size: 64,
            backup_retention: 1,
            auto_backup: false,
            cache_ttl_ms: 1_000,
            cache_capacity: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_env_flag;

    #[test]
    fn parse_env_flag_accepts_truthy_values() {
        for value in ["1", "true", "TRUE", " yes ", "on"] {
            assert_eq!(parse_env_flag(value), Some(true), "value: {}", value);
        }
    }

    #[test]
    fn parse_env_flag_accepts_falsy_values() {
        for value in ["", "0", "false", "FALSE", " no ", "off"] {
            assert_eq!(parse_env_flag(value), Some(false), "value: {}", value);
        }
    }

    #[test]
    fn parse_env_flag_rejects_unknown_values() {
        assert_eq!(parse_env_flag("maybe"), None);
        assert_eq!(parse_env_flag("enabled"), None);
    }
}
