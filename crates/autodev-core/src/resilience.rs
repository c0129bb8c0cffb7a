//! API-error detection and recovery backoff.
//!
//! Agent output indicating an API-level failure (rate limiting,
//! overload) triggers a scheduler-wide pause and a capped, jittered
//! backoff before an automatic resume. Detection is a substring predicate
//! over known markers; the marker list is deliberately a single tuning
//! knob.

use rand::Rng;

use crate::config::ApiErrorConfig;

/// Substring markers of API-level errors in agent output.
const API_ERROR_MARKERS: &[&str] = &[
    "overloaded_error",
    "rate_limit_error",
    "api error: 429",
    "api error: 529",
    "overloaded",
    "rate limit exceeded",
    "too many requests",
    "quota exceeded",
];

/// Whether free-text agent output looks like an API-level error.
pub fn is_api_error_symptom(text: &str) -> bool {
    let lower = text.to_lowercase();
    API_ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

/// Scheduler-side API-error recovery state: counts global resume
/// attempts and computes backoff delays.
#[derive(Debug)]
pub struct ResilienceState {
    config: ApiErrorConfig,
    attempts: u32,
    /// Incremented on every pause/resume cycle so a stale resume timer
    /// cannot fire into a newer cycle.
    generation: u64,
}

impl ResilienceState {
    pub fn new(config: ApiErrorConfig) -> Self {
        Self {
            config,
            attempts: 0,
            generation: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &ApiErrorConfig {
        &self.config
    }

    /// Register an API-error pause. Returns `Some(delay_ms)` with the
    /// backoff before the automatic resume, or `None` once the global
    /// attempt cap is exhausted.
    pub fn next_resume_delay(&mut self) -> Option<u64> {
        if self.attempts >= self.config.max_retries {
            return None;
        }
        self.attempts += 1;
        self.generation += 1;
        Some(backoff_with_jitter(
            self.attempts,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
            self.config.jitter_ratio,
        ))
    }

    /// Reset the attempt counter after a fully successful recovery.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.generation += 1;
    }
}

/// Exponential backoff with proportional jitter:
/// `min(max, base * 2^(attempt-1))` widened by up to `jitter_ratio`.
fn backoff_with_jitter(attempt: u32, base_ms: u64, max_ms: u64, jitter_ratio: f64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(20);
    let raw = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    let jitter_span = (raw as f64 * jitter_ratio.clamp(0.0, 1.0)) as u64;
    let jitter = if jitter_span == 0 {
        0
    } else {
        rand::rng().random_range(0..=jitter_span)
    };
    raw.saturating_add(jitter).min(max_ms.saturating_add(jitter_span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_detected_case_insensitively() {
        assert!(is_api_error_symptom("Error: Overloaded_Error from upstream"));
        assert!(is_api_error_symptom("HTTP API error: 429"));
        assert!(is_api_error_symptom("rate limit exceeded, retry later"));
        assert!(!is_api_error_symptom("all tests passed"));
        assert!(!is_api_error_symptom("wrote 429 bytes"));
    }

    #[test]
    fn attempts_cap_at_configured_max() {
        let mut state = ResilienceState::new(ApiErrorConfig {
            max_retries: 2,
            ..Default::default()
        });
        assert!(state.next_resume_delay().is_some());
        assert!(state.next_resume_delay().is_some());
        assert!(state.next_resume_delay().is_none(), "cap reached");
        assert_eq!(state.attempts(), 2);
    }

    #[test]
    fn delays_grow_exponentially_within_bounds() {
        let config = ApiErrorConfig {
            max_retries: 5,
            base_delay_ms: 10_000,
            max_delay_ms: 300_000,
            jitter_ratio: 0.2,
            ..Default::default()
        };
        let mut state = ResilienceState::new(config);

        let d1 = state.next_resume_delay().unwrap();
        assert!((10_000..=12_000).contains(&d1), "attempt 1: {d1}");

        let d2 = state.next_resume_delay().unwrap();
        assert!((20_000..=24_000).contains(&d2), "attempt 2: {d2}");

        let d3 = state.next_resume_delay().unwrap();
        assert!((40_000..=48_000).contains(&d3), "attempt 3: {d3}");
    }

    #[test]
    fn delay_never_exceeds_cap_plus_jitter() {
        let config = ApiErrorConfig {
            max_retries: 10,
            base_delay_ms: 100_000,
            max_delay_ms: 300_000,
            jitter_ratio: 0.2,
            ..Default::default()
        };
        let mut state = ResilienceState::new(config);
        for _ in 0..10 {
            if let Some(d) = state.next_resume_delay() {
                assert!(d <= 360_000, "delay {d} above cap + jitter span");
            }
        }
    }

    #[test]
    fn reset_clears_attempts_and_bumps_generation() {
        let mut state = ResilienceState::new(ApiErrorConfig::default());
        state.next_resume_delay();
        let generation = state.generation();
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert!(state.generation() > generation);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        assert_eq!(backoff_with_jitter(1, 5_000, 300_000, 0.0), 5_000);
        assert_eq!(backoff_with_jitter(3, 5_000, 300_000, 0.0), 20_000);
        assert_eq!(backoff_with_jitter(10, 5_000, 15_000, 0.0), 15_000);
    }
}
