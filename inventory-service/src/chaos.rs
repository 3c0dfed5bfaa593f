//! Failure-injection toggles, env-driven and off by default.
//!
//! Gremlin mode delays the reserve handler long enough to breach the
//! coordinator's client deadline; Schrödinger mode kills the process after
//! the transaction committed but before the reply is sent, leaving the
//! caller unable to know the outcome. Both exist to exercise the
//! verification recovery path.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct ChaosConfig {
    pub gremlin: bool,
    pub gremlin_min_ms: u64,
    pub gremlin_max_ms: u64,
    pub schrodinger: bool,
    pub crash_probability: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            gremlin: false,
            gremlin_min_ms: 2500,
            gremlin_max_ms: 4000,
            schrodinger: false,
            crash_probability: 0.5,
        }
    }
}

fn flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("yes")
    )
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl ChaosConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            gremlin: flag(std::env::var("GREMLIN_MODE").ok()),
            gremlin_min_ms: parse_or(
                std::env::var("GREMLIN_MIN_DELAY_MS").ok(),
                defaults.gremlin_min_ms,
            ),
            gremlin_max_ms: parse_or(
                std::env::var("GREMLIN_MAX_DELAY_MS").ok(),
                defaults.gremlin_max_ms,
            ),
            schrodinger: flag(std::env::var("SCHRODINGER_MODE").ok()),
            crash_probability: parse_or(
                std::env::var("SCHRODINGER_CRASH_PROBABILITY").ok(),
                defaults.crash_probability,
            ),
        }
    }

    pub fn enabled(&self) -> bool {
        self.gremlin || self.schrodinger
    }

    /// Delay the handler at entry, before any database work.
    pub async fn gremlin_delay(&self) {
        if !self.gremlin {
            return;
        }
        let (min, max) = (
            self.gremlin_min_ms.min(self.gremlin_max_ms),
            self.gremlin_min_ms.max(self.gremlin_max_ms),
        );
        let delay = rand::thread_rng().gen_range(min..=max);
        warn!(delay_ms = delay, "gremlin: delaying reserve handler");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    /// Call strictly after the commit: aborting here leaves a committed
    /// reservation whose outcome the caller never learns.
    pub fn maybe_crash(&self) {
        if !self.schrodinger {
            return;
        }
        if rand::thread_rng().gen::<f64>() < self.crash_probability {
            error!("schrödinger: crashing after commit, before reply");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_truthy_spellings() {
        assert!(flag(Some("true".to_string())));
        assert!(flag(Some("1".to_string())));
        assert!(flag(Some(" yes ".to_string())));
        assert!(!flag(Some("false".to_string())));
        assert!(!flag(Some("0".to_string())));
        assert!(!flag(None));
    }

    #[test]
    fn numeric_fields_fall_back_to_defaults() {
        assert_eq!(parse_or(Some("1500".to_string()), 2500u64), 1500);
        assert_eq!(parse_or(Some("not-a-number".to_string()), 2500u64), 2500);
        assert_eq!(parse_or::<f64>(Some("0.25".to_string()), 0.5), 0.25);
        assert_eq!(parse_or::<f64>(None, 0.5), 0.5);
    }

    #[test]
    fn chaos_is_off_by_default() {
        let config = ChaosConfig::default();
        assert!(!config.enabled());
    }
}
