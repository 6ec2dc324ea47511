//! Two-tier token-bucket rate limiting for outbound API calls.
//!
//! Buckets exist at two levels: per model (keyed by `base_url|model_name`)
//! and per provider (keyed by provider name). When a provider-wide RPM is
//! configured, a call consumes a provider token *only* — the provider
//! budget subsumes the model budget, which keeps provider headroom stable
//! when several models share one provider.
//!
//! Bucket rates are first-writer-wins: once an identity has a bucket, a
//! later caller asking for a different RPM gets a warning and the original
//! rate. Editing a config mid-run must not make the realized rate
//! oscillate.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// A model bucket always allows at least this much burst.
const MODEL_BURST_FLOOR: usize = 5;

/// A provider bucket always allows at least this much burst.
const PROVIDER_BURST_FLOOR: usize = 3;

/// The burst capacity of a model bucket.
pub fn model_burst(rpm: usize) -> usize {
    MODEL_BURST_FLOOR.max(rpm / 5)
}

/// The burst capacity of a provider bucket.
pub fn provider_burst(rpm: usize, burst_percent: u32) -> usize {
    PROVIDER_BURST_FLOOR.max(rpm * burst_percent as usize / 100)
}

/// A provider-level limit, when one is configured.
#[derive(Debug, Clone, Copy)]
pub struct ProviderLimit<'a> {
    pub name: &'a str,
    pub rpm: usize,
    pub burst_percent: u32,
}

/// One token bucket plus the rate it was created with.
struct Bucket {
    limiter: RateLimiter,
    rpm: usize,
}

impl Bucket {
    /// Tokens accrue at `rpm / 60` per second, capped at `burst`. The
    /// bucket starts full so short runs are not throttled at all.
    fn new(rpm: usize, burst: usize) -> Self {
        let limiter = RateLimiter::builder()
            .initial(burst)
            .max(burst)
            .refill(1)
            .interval(Duration::from_secs_f64(60.0 / rpm as f64))
            .build();
        Self { limiter, rpm }
    }
}

/// The process-wide pool of rate-limit buckets.
///
/// Safe for arbitrary concurrent callers: the maps are behind one coarse
/// mutex (lookups are cheap and short), and the buckets themselves are
/// lock-free once created.
#[derive(Default)]
pub struct RateLimiterPool {
    models: Mutex<HashMap<String, Arc<Bucket>>>,
    providers: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl RateLimiterPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a token is available for this call, or the run is
    /// cancelled. Returns how long the call waited.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        model_id: &str,
        model_rpm: usize,
        provider: Option<ProviderLimit<'_>>,
    ) -> Result<Duration> {
        let bucket = match provider {
            Some(limit) if limit.rpm > 0 => lookup_or_create(
                &self.providers,
                limit.name,
                limit.rpm,
                provider_burst(limit.rpm, limit.burst_percent),
            ),
            _ => lookup_or_create(
                &self.models,
                model_id,
                model_rpm,
                model_burst(model_rpm),
            ),
        };

        let started = Instant::now();
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(anyhow!("cancelled while waiting for a rate-limit token"))
            }
            _ = bucket.limiter.acquire_one() => Ok(started.elapsed()),
        }
    }

    /// The rate a model bucket was created with, if it exists.
    #[cfg(test)]
    fn model_bucket_rpm(&self, model_id: &str) -> Option<usize> {
        let models = self.models.lock().expect("lock poisoned");
        models.get(model_id).map(|b| b.rpm)
    }

    /// Does a model bucket exist for this identity?
    #[cfg(test)]
    fn has_model_bucket(&self, model_id: &str) -> bool {
        let models = self.models.lock().expect("lock poisoned");
        models.contains_key(model_id)
    }
}

/// Find or create the bucket for `key`. First writer wins: an existing
/// bucket is reused even if `rpm` differs from the rate it was built with.
fn lookup_or_create(
    map: &Mutex<HashMap<String, Arc<Bucket>>>,
    key: &str,
    rpm: usize,
    burst: usize,
) -> Arc<Bucket> {
    let mut map = map.lock().expect("lock poisoned");
    if let Some(bucket) = map.get(key) {
        if bucket.rpm != rpm {
            warn!(
                identity = key,
                configured = rpm,
                active = bucket.rpm,
                "rate limit changed mid-run; keeping the original rate"
            );
        }
        return bucket.clone();
    }
    let bucket = Arc::new(Bucket::new(rpm.max(1), burst.max(1)));
    map.insert(key.to_owned(), bucket.clone());
    bucket
}
