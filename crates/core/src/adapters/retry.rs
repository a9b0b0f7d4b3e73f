//! # Retry Policy
//!
//! Exponential backoff with jitter and per-stage retry ceilings.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::error::AdapterError;
use crate::workflow::Stage;

/// `base * 2^attempt`, capped, with symmetric jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, `0.25` = ±25%
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with(attempt, unit)
    }

    /// Deterministic variant: `unit` in `[-1, 1]` picks the jitter offset.
    /// The jittered delay never exceeds `max_delay_ms`.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let exp = 2u64.saturating_pow(attempt.min(32));
        let raw = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        let jitter = self.jitter.clamp(0.0, 1.0) * unit.clamp(-1.0, 1.0);
        let ms = (raw as f64 * (1.0 + jitter)).round().max(0.0) as u64;
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// How many consecutive transient failures a stage may accumulate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub default_ceiling: u32,
    pub per_stage: BTreeMap<Stage, u32>,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_ceiling: 3,
            per_stage: BTreeMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn ceiling_for(&self, stage: Stage) -> u32 {
        self.per_stage
            .get(&stage)
            .copied()
            .unwrap_or(self.default_ceiling)
            .max(1)
    }

    pub fn is_exhausted(&self, stage: Stage, retry_count: u32) -> bool {
        retry_count >= self.ceiling_for(stage)
    }
}

/// Run `op` until it succeeds, fails permanently, or `ceiling` transient
/// failures have accumulated.
pub async fn with_retry<T, F, Fut>(
    ceiling: u32,
    backoff: &BackoffPolicy,
    mut op: F,
) -> Result<T, AdapterError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let ceiling = ceiling.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(AdapterError::Transient(reason)) if attempt + 1 < ceiling => {
                let delay = backoff.delay_for(attempt);
                tracing::warn!(attempt = attempt + 1, ceiling, ?delay, %reason, "Transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
        };
        assert_eq!(policy.delay_with(0, 0.0), Duration::from_millis(500));
        assert_eq!(policy.delay_with(1, 0.0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_with(3, 0.0), Duration::from_millis(4_000));
        assert_eq!(policy.delay_with(10, 0.0), Duration::from_millis(30_000));
        assert_eq!(policy.delay_with(200, 0.0), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with(2, 1.0), Duration::from_millis(2_500));
        assert_eq!(policy.delay_with(2, -1.0), Duration::from_millis(1_500));
        for _ in 0..100 {
            let d = policy.delay_for(2).as_millis();
            assert!((1_500..=2_500).contains(&d), "delay {} out of band", d);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_with(10, 1.0), Duration::from_millis(30_000));
        assert_eq!(policy.delay_with(10, -1.0), Duration::from_millis(22_500));
        for _ in 0..100 {
            assert!(policy.delay_for(20) <= Duration::from_millis(policy.max_delay_ms));
        }
    }

    #[test]
    fn test_per_stage_ceiling() {
        let mut policy = RetryPolicy::default();
        policy.per_stage.insert(Stage::StoryGeneration, 5);
        assert_eq!(policy.ceiling_for(Stage::Extraction), 3);
        assert_eq!(policy.ceiling_for(Stage::StoryGeneration), 5);
        assert!(policy.is_exhausted(Stage::Extraction, 3));
        assert!(!policy.is_exhausted(Stage::StoryGeneration, 3));
    }

    #[test]
    fn test_policy_deserializes_stage_keys() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"per_stage": {"validation": 7}}"#).unwrap();
        assert_eq!(policy.ceiling_for(Stage::Validation), 7);
        assert_eq!(policy.default_ceiling, 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_at_ceiling() {
        let calls = AtomicU32::new(0);
        let backoff = BackoffPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        };
        let result: Result<(), _> = with_retry(3, &backoff, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::Transient("down".into())) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_with_retry_does_not_retry_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = tokio_test::block_on(with_retry(5, &BackoffPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AdapterError::Permanent("bad".into())) }
        }));
        assert!(!result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let backoff = BackoffPolicy {
            base_delay_ms: 1,
            max_delay_ms: 1,
            jitter: 0.0,
        };
        let value = with_retry(3, &backoff, |attempt| async move {
            if attempt < 2 {
                Err(AdapterError::Transient("flaky".into()))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }
}
