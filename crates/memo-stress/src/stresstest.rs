use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use memo_cache::MemoCache;
use memo_cache::config::Config;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Outcome, PreparedWorkload, WorkloadsConfig};

#[derive(Default)]
struct Stats {
    durations: DDSketch,
    values: usize,
    failures: usize,
    cancelled: usize,
}

impl Stats {
    fn record(&mut self, outcome: Outcome, duration: Duration) {
        self.durations.add(duration.as_secs_f64());
        match outcome {
            Outcome::Value => self.values += 1,
            Outcome::Failure => self.failures += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads, each with a cache of its own
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let mut memo_config = config.memo.clone();
            memo_config.name = format!("{}.workload{i}", memo_config.name);
            let cache = MemoCache::from_config(&memo_config);
            let workload = PreparedWorkload::new(i, workload, config.memo.default_policy, cache);
            Arc::new(workload)
        })
        .collect();

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                workload.process_request().await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        // only count the computations of the measured run
        for workload in &workloads {
            workload.take_computations();
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.workload.concurrency;
            let stats = Arc::new(Mutex::new(Stats::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let stats = Arc::clone(&stats);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let outcome = workload.process_request().await;

                            transaction.finish();

                            stats
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .record(outcome, task_start.elapsed());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let stats: Stats = {
                let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut stats)
            };
            stats
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (workload, task) in workloads.iter().zip(finished_tasks) {
        let stats = task?;
        let i = workload.index;
        let concurrency = workload.workload.concurrency;

        let ops = stats.durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = stats.durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(stats.durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");

        let computations = workload.computations.load(Ordering::Relaxed);
        let hit_ratio = workload.hit_ratio(ops);
        println!(
            "  values: {}; failures: {}; cancelled: {}; computations: {computations} (hit ratio {:.1}%)",
            stats.values,
            stats.failures,
            stats.cancelled,
            hit_ratio * 100.0,
        );
        println!(
            "  entries: {}; locks in flight: {}",
            workload.cache.entry_count(),
            workload.cache.in_flight()
        );

        workload.cache.close();
    }

    Ok(())
}
