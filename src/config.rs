use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Database file path. `None` uses an in-memory database (tests).
    pub db_path: Option<PathBuf>,
    /// Records fetched per page during the initial build.
    pub build_page_size: usize,
    /// Result page size for a single search call.
    pub search_page_size: usize,
    /// Ceiling on records examined by the on-disk fallback per search call.
    pub uncached_scan_ceiling: usize,
    /// Byte budget for the in-memory cache of decrypted records.
    pub cache_budget_bytes: usize,
    /// Maximum retries for a transient transport failure.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt up to `max_backoff`.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive protocol violations tolerated before a sync attempt is
    /// treated as corruption.
    pub max_protocol_violations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            build_page_size: 150,
            search_page_size: 50,
            uncached_scan_ceiling: 500,
            cache_budget_bytes: 100 * 1024 * 1024,
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(16),
            max_protocol_violations: 3,
        }
    }
}

impl EngineConfig {
    /// Backoff delay for the given zero-based attempt, doubling from
    /// `base_backoff` and capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = EngineConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(450),
            ..Default::default()
        };

        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        // Capped from here on
        assert_eq!(config.backoff_delay(3), Duration::from_millis(450));
        assert_eq!(config.backoff_delay(30), Duration::from_millis(450));
    }
}
