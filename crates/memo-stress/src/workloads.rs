use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use memo_cache::{CacheKey, CachePolicy, CancellationToken, MemoCache, MemoError};
use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workloads.is_empty() {
            bail!("no workloads defined");
        }
        for (i, workload) in self.workloads.iter().enumerate() {
            if workload.concurrency == 0 || workload.keys == 0 {
                bail!("workload {i}: `concurrency` and `keys` must be greater than zero");
            }
            if !(0.0..=1.0).contains(&workload.failure_rate) {
                bail!("workload {i}: `failure_rate` must be between 0 and 1");
            }
        }
        Ok(())
    }
}

/// A synthetic load pattern hitting one cache.
#[derive(Debug, Deserialize)]
pub struct Workload {
    /// The number of requests in flight at any time.
    pub concurrency: usize,
    /// The number of distinct keys requests are spread across.
    pub keys: u64,
    /// How long a single computation takes.
    #[serde(with = "humantime_serde", default)]
    pub compute_time: Duration,
    /// The probability of a computation failing.
    #[serde(default)]
    pub failure_rate: f64,
    /// Requests give up after this long, cancelling their wait or computation.
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    /// How long computed values are kept, defaults to the configured `default_policy`.
    #[serde(default)]
    pub policy: Option<CachePolicy>,
}

/// The outcome of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Value,
    Failure,
    Cancelled,
}

/// A workload ready to run against its own cache.
pub struct PreparedWorkload {
    pub index: usize,
    pub workload: Workload,
    pub policy: CachePolicy,
    pub cache: MemoCache<u64, String>,
    pub computations: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    pub fn new(
        index: usize,
        workload: Workload,
        default_policy: CachePolicy,
        cache: MemoCache<u64, String>,
    ) -> Self {
        Self {
            index,
            policy: workload.policy.unwrap_or(default_policy),
            workload,
            cache,
            computations: Default::default(),
        }
    }

    /// Returns the number of factory invocations so far, and starts counting from zero again.
    pub fn take_computations(&self) -> usize {
        self.computations.swap(0, Ordering::Relaxed)
    }

    /// The share of `ops` requests that were served without a computation of their own.
    pub fn hit_ratio(&self, ops: usize) -> f64 {
        if ops == 0 {
            return 0.0;
        }
        let computations = self.computations.load(Ordering::Relaxed) as f64;
        (1.0 - computations / ops as f64).max(0.0)
    }

    /// Requests a random key of this workload.
    pub async fn process_request(&self) -> Outcome {
        let (key_index, fails) = {
            let mut rng = rand::rng();
            (
                rng.random_range(0..self.workload.keys),
                rng.random_bool(self.workload.failure_rate),
            )
        };
        let key = CacheKey::builder(format!("stresstest.workload{}", self.index))
            .with_arg(&key_index)
            .build();

        let computations = Arc::clone(&self.computations);
        let compute_time = self.workload.compute_time;
        let cancel = CancellationToken::new();
        let timer = self.workload.timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        });

        let result = self
            .cache
            .get_or_compute(key, &self.policy, &cancel, move |cancel| async move {
                computations.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    _ = tokio::time::sleep(compute_time) => {},
                    _ = cancel.cancelled() => return Err("cancelled".to_owned()),
                }
                if fails {
                    Err(format!("computing key {key_index} failed"))
                } else {
                    Ok(key_index)
                }
            })
            .await;

        if let Some(timer) = timer {
            timer.abort();
        }

        match result {
            Ok(_) => Outcome::Value,
            Err(MemoError::Factory(_)) => Outcome::Failure,
            Err(MemoError::Cancelled) => Outcome::Cancelled,
            Err(error) => {
                tracing::warn!(%error, "Request did not complete");
                Outcome::Failure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 100
                keys: 10
                compute_time: 25ms
                failure_rate: 0.1
                timeout: 100ms
                policy:
                  absolute_ttl: 1s
              - concurrency: 10
                keys: 1
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let first = &config.workloads[0];
        assert_eq!(first.compute_time, Duration::from_millis(25));
        assert_eq!(first.timeout, Some(Duration::from_millis(100)));
        assert_eq!(
            first.policy,
            Some(CachePolicy::absolute(Duration::from_secs(1)))
        );

        let second = &config.workloads[1];
        assert_eq!(second.compute_time, Duration::ZERO);
        assert_eq!(second.failure_rate, 0.0);
        assert_eq!(second.policy, None);
    }

    #[test]
    fn test_invalid_workloads() {
        let config: WorkloadsConfig =
            serde_yaml::from_str("workloads: [{concurrency: 1, keys: 1, failure_rate: 2.0}]")
                .unwrap();
        assert!(config.validate().is_err());

        let config: WorkloadsConfig = serde_yaml::from_str("workloads: []").unwrap();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_process_request() {
        memo_test::setup();

        let workload = Workload {
            concurrency: 1,
            keys: 1,
            compute_time: Duration::from_millis(1),
            failure_rate: 0.0,
            timeout: None,
            policy: None,
        };
        let prepared =
            PreparedWorkload::new(0, workload, CachePolicy::never_expire(), MemoCache::new());

        for _ in 0..4 {
            assert_eq!(prepared.process_request().await, Outcome::Value);
        }
        assert_eq!(prepared.computations.load(Ordering::Relaxed), 1);
        assert_eq!(prepared.hit_ratio(4), 0.75);
    }

    #[tokio::test]
    async fn test_warmup_is_not_counted() {
        memo_test::setup();

        let workload = Workload {
            concurrency: 1,
            keys: 1,
            compute_time: Duration::from_millis(1),
            failure_rate: 0.0,
            timeout: None,
            policy: None,
        };
        let prepared =
            PreparedWorkload::new(0, workload, CachePolicy::never_expire(), MemoCache::new());

        // warmup computes the only key
        prepared.process_request().await;
        assert_eq!(prepared.take_computations(), 1);

        // the measured requests are all hits
        prepared.process_request().await;
        prepared.process_request().await;
        assert_eq!(prepared.take_computations(), 0);
        assert_eq!(prepared.hit_ratio(2), 1.0);
        assert_eq!(prepared.hit_ratio(0), 0.0);
    }
}
