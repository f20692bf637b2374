//! Typed configuration for the control plane, loaded from the environment
//! via `dotenvy` with explicit-struct construction as the programmatic path.

use std::time::Duration;

/// Truthy tokens accepted by env-var boolean parsing (feature flags, §4.A).
const TRUTHY: &[&str] = &["true", "1", "yes", "on", "enabled"];
/// Falsy tokens accepted by env-var boolean parsing.
const FALSY: &[&str] = &["false", "0", "no", "off", "disabled"];

/// Parse a boolean environment value, case-insensitively and trimmed.
///
/// Any non-empty value that matches neither table falls back to `default`
/// and the caller is expected to log a warning (feature flags do this; other
/// callers may choose not to).
pub fn parse_bool_env(raw: &str, default: bool) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Some(default);
    }
    if TRUTHY.contains(&normalized.as_str()) {
        return Some(true);
    }
    if FALSY.contains(&normalized.as_str()) {
        return Some(false);
    }
    None
}

/// Converts an internal camelCase flag name to the `ENABLE_<UPPER_SNAKE>`
/// environment variable name it is overridden by.
pub fn flag_env_var(name: &str) -> String {
    let mut snake = String::with_capacity(name.len() + 8);
    snake.push_str("ENABLE_");
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() && i > 0 {
            snake.push('_');
        }
        snake.push(ch.to_ascii_uppercase());
    }
    snake
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyLimits {
    pub max_children: usize,
    pub max_depth: u32,
}

impl Default for HierarchyLimits {
    fn default() -> Self {
        Self { max_children: 10, max_depth: 8 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StateMachineConfig {
    pub stale_timeout: Duration,
    pub max_event_log_size: usize,
    pub max_history_len: usize,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(30 * 60),
            max_event_log_size: 2048,
            max_history_len: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub plan: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { plan: "Free".to_string() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DashboardConfig {
    pub update_interval: Duration,
    pub max_artifacts: usize,
    pub max_timeline: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            max_artifacts: 100,
            max_timeline: 50,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextRetrieverConfig {
    pub max_tokens: usize,
    pub buffer_percent: f64,
    pub layer1_limit: usize,
    pub cache_size: usize,
    pub cache_ttl: Duration,
}

impl Default for ContextRetrieverConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8_000,
            buffer_percent: 0.1,
            layer1_limit: 10,
            cache_size: 256,
            cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinationDbConfig {
    pub default_lock_ttl: Duration,
    pub stale_session_threshold: Duration,
}

impl Default for CoordinationDbConfig {
    fn default() -> Self {
        Self {
            default_lock_ttl: Duration::from_secs(30),
            stale_session_threshold: Duration::from_secs(10 * 60),
        }
    }
}

/// Aggregate configuration for every service the control plane owns.
#[derive(Debug, Clone, Default)]
pub struct ControlPlaneConfig {
    pub hierarchy: HierarchyLimits,
    pub state_machine: StateMachineConfig,
    pub rate_limit: RateLimitConfig,
    pub dashboard: DashboardConfig,
    pub context_retriever: ContextRetrieverConfig,
    pub coordination_db: CoordinationDbConfig,
}

impl ControlPlaneConfig {
    /// Load `.env` (if present) and overlay a handful of top-level knobs from
    /// the process environment on top of the struct defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Ok(plan) = std::env::var("SWARMCTL_RATE_LIMIT_PLAN") {
            config.rate_limit.plan = plan;
        }
        if let Ok(raw) = std::env::var("SWARMCTL_MAX_CHILDREN")
            && let Ok(value) = raw.trim().parse()
        {
            config.hierarchy.max_children = value;
        }
        if let Ok(raw) = std::env::var("SWARMCTL_MAX_DEPTH")
            && let Ok(value) = raw.trim().parse()
        {
            config.hierarchy.max_depth = value;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_and_falsy_tokens_parse_case_insensitively() {
        assert_eq!(parse_bool_env("TRUE", false), Some(true));
        assert_eq!(parse_bool_env(" yes ", false), Some(true));
        assert_eq!(parse_bool_env("Off", true), Some(false));
        assert_eq!(parse_bool_env("", false), Some(false));
    }

    #[test]
    fn unrecognized_token_returns_none() {
        assert_eq!(parse_bool_env("maybe", true), None);
    }

    #[test]
    fn flag_env_var_converts_camel_case() {
        assert_eq!(flag_env_var("cacheEnabled"), "ENABLE_CACHE_ENABLED");
        assert_eq!(flag_env_var("autoSave"), "ENABLE_AUTO_SAVE");
    }
}
