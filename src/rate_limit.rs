//! Token-bucket admission control.
//!
//! Three disjoint bucket families share this implementation: `general` and
//! `terminal-create` key on the client IP, `input` keys on `(IP, session
//! id)`. Each family owns a map of keys to [`TokenBucket`]s behind an async
//! `RwLock`, generalized to an arbitrary key type so the three families
//! share one implementation instead of three copy-pasted ones.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::config::BucketLimits;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ok,
    Denied { retry_after_secs: u64 },
}

/// One token bucket: `points` tokens, replenished continuously over
/// `window`, with a hard `block_duration` applied once exhausted.
#[derive(Debug, Clone)]
struct TokenBucket {
    points: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl TokenBucket {
    fn new(limits: &BucketLimits) -> Self {
        Self {
            points: limits.points as f64,
            last_refill: Instant::now(),
            blocked_until: None,
        }
    }

    fn refill(&mut self, limits: &BucketLimits, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let rate = limits.points as f64 / limits.window.as_secs_f64();
        self.points = (self.points + rate * elapsed.as_secs_f64()).min(limits.points as f64);
        self.last_refill = now;
    }

    fn admit(&mut self, limits: &BucketLimits, now: Instant) -> Admission {
        if let Some(until) = self.blocked_until {
            if now < until {
                let retry_after_secs = (until - now).as_secs().max(1);
                return Admission::Denied { retry_after_secs };
            }
            self.blocked_until = None;
        }

        self.refill(limits, now);

        if self.points >= 1.0 {
            self.points -= 1.0;
            Admission::Ok
        } else {
            let until = now + limits.block_duration;
            self.blocked_until = Some(until);
            Admission::Denied {
                retry_after_secs: limits.block_duration.as_secs().max(1),
            }
        }
    }

    /// A bucket is idle (and therefore evictable) once fully refilled and
    /// not presently blocked.
    fn is_idle(&self, limits: &BucketLimits, now: Instant) -> bool {
        self.blocked_until.is_none() && now.saturating_duration_since(self.last_refill) > limits.window
    }
}

/// A family of token buckets keyed by `K`, sharing one set of [`BucketLimits`].
pub struct RateLimiterFamily<K> {
    limits: BucketLimits,
    buckets: RwLock<HashMap<K, TokenBucket>>,
}

impl<K> RateLimiterFamily<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(limits: BucketLimits) -> Self {
        Self {
            limits,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Admit one request for `key`, creating its bucket on first use.
    pub async fn admit(&self, key: K) -> Admission {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(&self.limits));
        bucket.admit(&self.limits, now)
    }

    /// Drop buckets that have fully refilled and are not blocked. Call
    /// periodically from the same sweep that reaps idle sessions so the map
    /// does not grow without bound under high client churn.
    pub async fn evict_idle(&self) {
        let now = Instant::now();
        let limits = self.limits;
        let mut buckets = self.buckets.write().await;
        buckets.retain(|_, bucket| !bucket.is_idle(&limits, now));
    }

    #[cfg(test)]
    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }
}

/// Stand-in `Duration` helper used by tests below to fast-forward the clock
/// without sleeping; production code only ever observes `Instant::now()`.
#[cfg(test)]
fn limits(points: u32, window: Duration, block: Duration) -> BucketLimits {
    BucketLimits {
        points,
        window,
        block_duration: block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
    }

    #[tokio::test]
    async fn admits_up_to_points_then_blocks() {
        let family = RateLimiterFamily::new(limits(3, Duration::from_secs(60), Duration::from_secs(30)));
        let key = ip(1);
        assert_eq!(family.admit(key).await, Admission::Ok);
        assert_eq!(family.admit(key).await, Admission::Ok);
        assert_eq!(family.admit(key).await, Admission::Ok);
        match family.admit(key).await {
            Admission::Denied { retry_after_secs } => assert_eq!(retry_after_secs, 30),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tripping_one_keys_bucket_does_not_affect_another() {
        let family = RateLimiterFamily::new(limits(1, Duration::from_secs(60), Duration::from_secs(30)));
        assert_eq!(family.admit(ip(1)).await, Admission::Ok);
        assert!(matches!(family.admit(ip(1)).await, Admission::Denied { .. }));
        // A different key is unaffected.
        assert_eq!(family.admit(ip(2)).await, Admission::Ok);
    }

    #[tokio::test]
    async fn composite_key_isolation() {
        // tripping the input bucket for (ip, s1) must not affect (ip, s2).
        let family: RateLimiterFamily<(std::net::IpAddr, String)> =
            RateLimiterFamily::new(limits(1, Duration::from_secs(60), Duration::from_secs(30)));
        let ip1 = ip(1);
        assert_eq!(family.admit((ip1, "s1".to_string())).await, Admission::Ok);
        assert!(matches!(
            family.admit((ip1, "s1".to_string())).await,
            Admission::Denied { .. }
        ));
        assert_eq!(family.admit((ip1, "s2".to_string())).await, Admission::Ok);
    }
}
