//! Operational knobs for the scheduler, worker supervision, watchdog, and
//! API-error recovery, with defaults and range clamping.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard upper bound on concurrent workers.
pub const MAX_PARALLEL_CAP: usize = 4;

/// Auto-retry policy for failed tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoRetryConfig {
    pub enabled: bool,
    /// Maximum automatic retries per task (clamped to 10).
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (clamped to 1s..=5min).
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for AutoRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
        }
    }
}

impl AutoRetryConfig {
    /// Clamp all fields into their documented ranges.
    pub fn clamped(mut self) -> Self {
        self.max_retries = self.max_retries.min(10);
        self.base_delay_ms = self.base_delay_ms.clamp(1_000, 300_000);
        self.max_delay_ms = self.max_delay_ms.clamp(self.base_delay_ms, 300_000);
        self
    }
}

/// Per-category slow-tool timeouts, in milliseconds. `None` means no
/// timeout for the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowToolTimeouts {
    pub codex_ms: Option<u64>,
    pub gemini_ms: Option<u64>,
    pub npm_install_ms: Option<u64>,
    pub npm_build_ms: Option<u64>,
    pub default_ms: Option<u64>,
}

impl Default for SlowToolTimeouts {
    fn default() -> Self {
        Self {
            codex_ms: Some(60 * 60 * 1000),
            gemini_ms: Some(60 * 60 * 1000),
            npm_install_ms: Some(15 * 60 * 1000),
            npm_build_ms: Some(20 * 60 * 1000),
            default_ms: Some(10 * 60 * 1000),
        }
    }
}

/// Watchdog thresholds, shared by the per-worker timer and the
/// out-of-band diagnoser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Out-of-band diagnosis interval.
    pub check_interval_ms: u64,
    /// Per-worker watchdog tick interval.
    pub worker_tick_ms: u64,
    /// Idle-activity timeout when no slow tool is outstanding.
    pub activity_timeout_ms: u64,
    /// Optional hard cap on total worker wall time. `None` disables it.
    pub hard_timeout_ms: Option<u64>,
    pub slow_tool_timeouts: SlowToolTimeouts,
    /// Enable the AI-assisted diagnosis layer.
    pub ai_enabled: bool,
    /// Wall-time limit for one AI diagnosis call.
    pub ai_timeout_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5 * 60 * 1000,
            worker_tick_ms: 30_000,
            activity_timeout_ms: 3 * 60 * 1000,
            hard_timeout_ms: None,
            slow_tool_timeouts: SlowToolTimeouts::default(),
            ai_enabled: false,
            ai_timeout_ms: 60_000,
        }
    }
}

/// API-error recovery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiErrorConfig {
    /// Global resume attempts before the scheduler stays paused.
    pub max_retries: u32,
    /// Per-task API-error retry cap.
    pub max_task_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Uniform jitter applied to the backoff, as a ratio of the delay.
    pub jitter_ratio: f64,
}

impl Default for ApiErrorConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_task_retries: 3,
            base_delay_ms: 10_000,
            max_delay_ms: 300_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrent workers (clamped to 1..=4).
    pub max_parallel: usize,
    /// Scheduler tick period.
    pub tick_interval_ms: u64,
    pub auto_retry: AutoRetryConfig,
    /// Pause the scheduler when an open blocker issue arrives.
    pub blocker_auto_pause_enabled: bool,
    pub watchdog: WatchdogConfig,
    pub api_error: ApiErrorConfig,
    /// Agent CLI binary launched for each worker.
    pub agent_binary: String,
    /// Extra arguments appended to the agent command line.
    pub agent_args: Vec<String>,
    /// Root for sessions, logs, and watchdog op-logs. Defaults to the
    /// platform user-data directory.
    pub user_data_dir: Option<PathBuf>,
    /// Project root used to resolve persona prompt files.
    pub project_root: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            tick_interval_ms: 5_000,
            auto_retry: AutoRetryConfig::default(),
            blocker_auto_pause_enabled: true,
            watchdog: WatchdogConfig::default(),
            api_error: ApiErrorConfig::default(),
            agent_binary: "claude".to_string(),
            agent_args: Vec::new(),
            user_data_dir: None,
            project_root: None,
        }
    }
}

impl SchedulerConfig {
    /// Clamp all ranged fields into their documented bounds.
    pub fn clamped(mut self) -> Self {
        self.max_parallel = self.max_parallel.clamp(1, MAX_PARALLEL_CAP);
        self.auto_retry = self.auto_retry.clamped();
        self
    }

    /// Resolved user-data directory: the configured override, or the
    /// platform data dir under an `autodev` subdirectory.
    pub fn user_data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.user_data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("autodev")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_within_bounds() {
        let cfg = SchedulerConfig::default().clamped();
        assert!(cfg.max_parallel >= 1 && cfg.max_parallel <= MAX_PARALLEL_CAP);
        assert!(cfg.auto_retry.max_retries <= 10);
        assert!(cfg.auto_retry.base_delay_ms >= 1_000);
    }

    #[test]
    fn max_parallel_is_capped_at_four() {
        let cfg = SchedulerConfig {
            max_parallel: 16,
            ..Default::default()
        }
        .clamped();
        assert_eq!(cfg.max_parallel, 4);
    }

    #[test]
    fn retry_delays_are_clamped() {
        let cfg = AutoRetryConfig {
            enabled: true,
            max_retries: 99,
            base_delay_ms: 10,
            max_delay_ms: 10_000_000,
        }
        .clamped();
        assert_eq!(cfg.max_retries, 10);
        assert_eq!(cfg.base_delay_ms, 1_000);
        assert_eq!(cfg.max_delay_ms, 300_000);
    }

    #[test]
    fn slow_tool_defaults_match_documented_values() {
        let t = SlowToolTimeouts::default();
        assert_eq!(t.codex_ms, Some(3_600_000));
        assert_eq!(t.gemini_ms, Some(3_600_000));
        assert_eq!(t.npm_install_ms, Some(900_000));
        assert_eq!(t.npm_build_ms, Some(1_200_000));
        assert_eq!(t.default_ms, Some(600_000));
    }

    #[test]
    fn config_survives_toml_roundtrip_defaults() {
        // serde(default) lets a sparse config deserialize cleanly.
        let sparse: SchedulerConfig = serde_json::from_str(r#"{"max_parallel": 3}"#).unwrap();
        assert_eq!(sparse.max_parallel, 3);
        assert!(sparse.auto_retry.enabled);
    }
}
