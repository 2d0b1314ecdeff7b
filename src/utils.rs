//! Small helpers shared across SmithyMQ components.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Exponential backoff with a small deterministic spread per caller.
///
/// `attempt` starts at 1. The result is capped at 30 seconds. `seed` spreads
/// concurrent callers (workers, consumers) so they don't poll in lockstep.
pub fn calculate_backoff(attempt: u32, seed: u64) -> u64 {
    const BASE_MS: u64 = 100;
    const MAX_MS: u64 = 30_000;

    let exp = attempt.saturating_sub(1).min(16);
    let delay = BASE_MS.saturating_mul(1u64 << exp).min(MAX_MS);
    let spread = (seed.wrapping_mul(37) % 50).min(delay / 2);
    (delay + spread).min(MAX_MS)
}

/// Linear backoff used between WATCH transaction attempts (`attempt * base`).
pub fn linear_backoff(attempt: u32, base_ms: u64) -> u64 {
    u64::from(attempt).saturating_mul(base_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = calculate_backoff(1, 0);
        let second = calculate_backoff(2, 0);
        let third = calculate_backoff(3, 0);
        assert_eq!(first, 100);
        assert_eq!(second, 200);
        assert_eq!(third, 400);
        assert_eq!(calculate_backoff(40, 7), 30_000);
    }

    #[test]
    fn test_backoff_spread_is_bounded() {
        for seed in 0..20 {
            let delay = calculate_backoff(1, seed);
            assert!((100..=150).contains(&delay));
        }
    }

    #[test]
    fn test_linear_backoff() {
        assert_eq!(linear_backoff(1, 1000), 1000);
        assert_eq!(linear_backoff(3, 1000), 3000);
        assert_eq!(linear_backoff(0, 1000), 0);
    }

    #[test]
    fn test_now_ms_is_recent() {
        // 2020-01-01 in ms
        assert!(now_ms() > 1_577_836_800_000);
    }
}
