//! Engine tunables, read from `TRELLIS_*` environment variables.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Concurrent workers per watched GVK.
    pub workers: usize,
    /// How long a written object overrides stale cached reads.
    pub overlay_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Drop trigger registrations not refreshed by the latest pass of their source.
    pub collect_stale_triggers: bool,
    pub watch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            overlay_ttl: Duration::from_secs(10),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            collect_stale_triggers: false,
            watch_timeout: Duration::from_secs(290),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let workers = env_parse("TRELLIS_WORKERS").filter(|w: &usize| *w > 0).unwrap_or(d.workers);
        let overlay_ttl = env_parse("TRELLIS_OVERLAY_TTL_SECS").map(Duration::from_secs).unwrap_or(d.overlay_ttl);
        let backoff_base = env_parse("TRELLIS_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base);
        let backoff_max = env_parse("TRELLIS_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max);
        let collect_stale_triggers = std::env::var("TRELLIS_COLLECT_STALE_TRIGGERS")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(d.collect_stale_triggers);
        let watch_timeout = env_parse("TRELLIS_WATCH_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.watch_timeout);
        Self { workers, overlay_ttl, backoff_base, backoff_max, collect_stale_triggers, watch_timeout }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_env_overrides() {
        let d = EngineConfig::default();
        assert_eq!(d.workers, 5);
        assert_eq!(d.backoff_base, Duration::from_millis(5));

        std::env::set_var("TRELLIS_WORKERS", "9");
        std::env::set_var("TRELLIS_OVERLAY_TTL_SECS", "not-a-number");
        std::env::set_var("TRELLIS_COLLECT_STALE_TRIGGERS", "TRUE");
        let cfg = EngineConfig::from_env();
        std::env::remove_var("TRELLIS_WORKERS");
        std::env::remove_var("TRELLIS_OVERLAY_TTL_SECS");
        std::env::remove_var("TRELLIS_COLLECT_STALE_TRIGGERS");

        assert_eq!(cfg.workers, 9);
        assert_eq!(cfg.overlay_ttl, Duration::from_secs(10));
        assert!(cfg.collect_stale_triggers);
    }
}
