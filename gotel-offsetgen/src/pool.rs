// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Bounded worker pool over a job channel. Workers pull jobs, push
//! results into a collector channel, and stop on cancellation or on the
//! first fatal error.

use std::sync::Arc;

use log::debug;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::OffsetCache,
    errors::GenError,
    job::{Job, JobResult, run_job},
};

pub async fn run_jobs(
    jobs: Vec<Job>,
    workers: usize,
    cache: Arc<OffsetCache>,
    token: CancellationToken,
) -> Result<Vec<JobResult>, GenError> {
    let workers = workers.max(1);
    let expected = jobs.len();
    let (job_tx, job_rx) = mpsc::channel::<Job>(workers);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<Result<JobResult, GenError>>(workers);

    let feeder_token = token.clone();
    tokio::spawn(async move {
        for job in jobs {
            tokio::select! {
                _ = feeder_token.cancelled() => break,
                sent = job_tx.send(job) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        // Dropping job_tx lets the workers drain and exit.
    });

    for worker in 0..workers {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let cache = Arc::clone(&cache);
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                let job = job_rx.lock().await.recv().await;
                let Some(job) = job else {
                    break;
                };
                debug!(
                    "worker {worker}: {} {} on go{}",
                    job.manifest.name, job.app_version, job.toolchain
                );
                let result = run_job(&job, &cache).await;
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut results = Vec::with_capacity(expected);
    while let Some(result) = result_rx.recv().await {
        match result {
            Ok(job_result) => results.push(job_result),
            Err(e) => {
                // First fatal error stops dispatch; workers see the
                // cancellation and wind down, container temp dirs are
                // released by their scope guards.
                token.cancel();
                return Err(e);
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod test {
    use semver::Version;

    use crate::manifest::built_in_manifests;

    use super::*;

    /// Fully cached jobs complete without touching a container runtime.
    #[tokio::test]
    async fn test_cached_jobs_complete_without_builds() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(OffsetCache::open(dir.path()).unwrap());

        let manifest = built_in_manifests()
            .into_iter()
            .find(|m| m.name == "runtime")
            .unwrap();
        let toolchain = Version::new(1, 21, 0);
        for field in &manifest.wanted {
            cache.put(&toolchain, &toolchain, field, Some(152)).unwrap();
        }

        let jobs = vec![Job {
            manifest,
            toolchain: toolchain.clone(),
            app_version: toolchain.clone(),
        }];
        let results = run_jobs(jobs, 2, cache, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fields.len(), 1);
        assert_eq!(results[0].fields[0].offset, Some(152));
    }

    #[tokio::test]
    async fn test_cancelled_pool_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(OffsetCache::open(dir.path()).unwrap());
        let token = CancellationToken::new();
        token.cancel();

        let manifest = built_in_manifests()
            .into_iter()
            .find(|m| m.name == "runtime")
            .unwrap();
        let toolchain = Version::new(1, 21, 0);
        let jobs = (0..8)
            .map(|_| Job {
                manifest: manifest.clone(),
                toolchain: toolchain.clone(),
                app_version: toolchain.clone(),
            })
            .collect();

        let results = run_jobs(jobs, 2, cache, token).await.unwrap();
        // Nothing was dispatched after cancellation.
        assert!(results.len() < 8);
    }
}
