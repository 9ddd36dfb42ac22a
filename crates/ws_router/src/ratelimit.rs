use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ws_proto::{ErrorCode, RetryAfter, WsError};

use crate::{
    clock::Clock,
    middleware::{middleware_fn, Middleware},
};

/// Token-bucket policy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Bucket size; also the largest admissible single cost.
    pub capacity: u64,
    /// Refill rate.
    pub tokens_per_second: u64,
    /// Optional namespace prepended to every key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Outcome of one consumption attempt.
///
/// When `allowed` is false, `retry_after_ms` of `None` means the cost
/// exceeds the bucket capacity outright: impossible under the current
/// policy, do not retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: Option<u64>,
}

/// Rate-limiter seam consumed by middleware and application code.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn consume(&self, key: &str, cost: u64) -> RateLimitDecision;
}

struct Bucket {
    tokens: u64,
    last_refill: u64,
}

/// Token-bucket limiter with atomic per-key consumption and monotonic
/// refill.
///
/// Each key owns a fair async mutex, so concurrent `consume` calls on
/// one key execute in strict FIFO arrival order; distinct keys never
/// contend.
pub struct TokenBucketLimiter {
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Bucket>>>>,
}

impl TokenBucketLimiter {
    pub fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Drops every bucket and its lock.
    pub fn dispose(&self) {
        self.buckets.lock().expect("bucket table lock").clear();
    }

    fn bucket_for(&self, key: &str) -> Arc<tokio::sync::Mutex<Bucket>> {
        let full_key = match &self.policy.prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        };

        let mut buckets = self.buckets.lock().expect("bucket table lock");
        Arc::clone(buckets.entry(full_key).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(Bucket {
                tokens: self.policy.capacity,
                last_refill: self.clock.now_millis(),
            }))
        }))
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn consume(&self, key: &str, cost: u64) -> RateLimitDecision {
        let bucket = self.bucket_for(key);
        let mut bucket = bucket.lock().await;

        let now = self.clock.now_millis();
        // Clamp shields against non-monotonic clock skews.
        let elapsed_ms = now.saturating_sub(bucket.last_refill);
        let tokens_to_add = elapsed_ms * self.policy.tokens_per_second / 1000;
        bucket.tokens = (bucket.tokens + tokens_to_add).min(self.policy.capacity);
        bucket.last_refill = now;

        if cost > self.policy.capacity {
            return RateLimitDecision {
                allowed: false,
                remaining: bucket.tokens,
                retry_after_ms: None,
            };
        }

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return RateLimitDecision {
                allowed: true,
                remaining: bucket.tokens,
                retry_after_ms: None,
            };
        }

        let deficit = cost - bucket.tokens;
        let retry_after_ms =
            (deficit * 1000).div_ceil(self.policy.tokens_per_second);
        RateLimitDecision {
            allowed: false,
            remaining: bucket.tokens,
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

/// Middleware charging `cost` tokens per inbound message, keyed by
/// client id.
///
/// A refusal emits RESOURCE_EXHAUSTED through the context's unified
/// emitter and short-circuits the pipeline. The retry hint maps
/// straight from the limiter's decision: a cost the policy can never
/// satisfy becomes `retryAfterMs: null` on the wire.
pub fn rate_limit_middleware(limiter: Arc<dyn RateLimiter>, cost: u64) -> Arc<dyn Middleware> {
    middleware_fn(move |ctx, next| {
        let limiter = Arc::clone(&limiter);
        async move {
            let decision = limiter.consume(ctx.client_id(), cost).await;
            if decision.allowed {
                return next.run(ctx).await;
            }

            let retry_after = match decision.retry_after_ms {
                Some(ms) => RetryAfter::After(ms),
                None => RetryAfter::Never,
            };
            ctx.error(
                WsError::with_message(ErrorCode::ResourceExhausted, "rate limit exceeded")
                    .with_retry_after(retry_after),
            );
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    fn limiter(capacity: u64, tokens_per_second: u64, clock: &Arc<ManualClock>) -> TokenBucketLimiter {
        TokenBucketLimiter::new(
            RateLimitPolicy {
                capacity,
                tokens_per_second,
                prefix: None,
            },
            Arc::clone(clock) as Arc<dyn Clock>,
        )
    }

    #[tokio::test]
    async fn refill_is_floored_and_capped_at_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(10, 5, &clock);

        // Drain the bucket.
        let drained = limiter.consume("k", 10).await;
        assert!(drained.allowed);
        assert_eq!(drained.remaining, 0);

        // 2000 ms at 5 tokens/s refills 10, capped at capacity.
        clock.advance(2000);
        let decision = limiter.consume("k", 7).await;
        assert_eq!(
            decision,
            RateLimitDecision {
                allowed: true,
                remaining: 3,
                retry_after_ms: None,
            }
        );
    }

    #[tokio::test]
    async fn impossible_cost_reports_no_retry() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(10, 5, &clock);

        let decision = limiter.consume("k", 11).await;
        assert_eq!(
            decision,
            RateLimitDecision {
                allowed: false,
                remaining: 10,
                retry_after_ms: None,
            }
        );

        // Bucket state is irrelevant: still impossible after drain.
        let _ = limiter.consume("k", 10).await;
        let drained = limiter.consume("k", 11).await;
        assert!(!drained.allowed);
        assert_eq!(drained.retry_after_ms, None);
    }

    #[tokio::test]
    async fn deficit_yields_ceil_retry_hint() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(10, 3, &clock);

        let _ = limiter.consume("k", 10).await;
        let decision = limiter.consume("k", 7).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        // ceil(7 / 3 tokens-per-second) in milliseconds.
        assert_eq!(decision.retry_after_ms, Some(2334));
    }

    #[tokio::test]
    async fn clock_skew_never_subtracts_tokens() {
        let clock = Arc::new(ManualClock::new(5000));
        let limiter = limiter(10, 5, &clock);

        let _ = limiter.consume("k", 4).await;
        clock.rewind(3000);
        let decision = limiter.consume("k", 6).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn keys_are_isolated_and_prefixed() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = TokenBucketLimiter::new(
            RateLimitPolicy {
                capacity: 1,
                tokens_per_second: 1,
                prefix: Some("ip:".to_string()),
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        assert!(limiter.consume("a", 1).await.allowed);
        assert!(!limiter.consume("a", 1).await.allowed);
        assert!(limiter.consume("b", 1).await.allowed);

        limiter.dispose();
        assert!(limiter.consume("a", 1).await.allowed);
    }
}
