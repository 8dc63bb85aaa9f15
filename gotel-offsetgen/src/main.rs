// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, create_dir_all},
    sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use log::{LevelFilter, info};
use semver::Version;
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;

use crate::{
    args::Cli,
    cache::OffsetCache,
    fold::build_index,
    job::{FieldSource, Job, JobResult},
    manifest::{Manifest, VersionAxis, WantedField, built_in_manifests},
    pool::run_jobs,
};

mod args;
mod builder;
mod cache;
mod dwarf;
mod errors;
mod fold;
mod job;
mod manifest;
mod pool;
mod render;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbosity);

    let workers = cli.workers.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(4)
    });

    create_dir_all(&cli.storage).context("unable to create storage directory")?;
    let cache = Arc::new(OffsetCache::open(&cli.storage)?);

    let jobs = expand_jobs(built_in_manifests());
    info!("dispatching {} jobs across {workers} workers", jobs.len());

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let results = run_jobs(jobs, workers, Arc::clone(&cache), token).await?;
    report(&results);

    let index = build_index(&accumulate(&results));
    let output = File::create(&cli.output)
        .with_context(|| format!("unable to create {}", cli.output.display()))?;
    serde_json::to_writer_pretty(output, &index).context("unable to serialize index")?;
    cache.flush()?;

    info!(
        "wrote offsets for {} structs to {}",
        index.data.len(),
        cli.output.display()
    );
    Ok(())
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

/// The cartesian product each manifest asks for: toolchains for
/// standard-library manifests, library versions x toolchains otherwise.
fn expand_jobs(manifests: Vec<Manifest>) -> Vec<Job> {
    let mut jobs = Vec::new();
    for manifest in manifests {
        match manifest.axis.clone() {
            VersionAxis::Toolchain => {
                for toolchain in manifest.toolchains.clone() {
                    jobs.push(Job {
                        manifest: manifest.clone(),
                        app_version: toolchain.clone(),
                        toolchain,
                    });
                }
            }
            VersionAxis::Library(app_versions) => {
                for toolchain in manifest.toolchains.clone() {
                    for app_version in &app_versions {
                        jobs.push(Job {
                            manifest: manifest.clone(),
                            toolchain: toolchain.clone(),
                            app_version: app_version.clone(),
                        });
                    }
                }
            }
        }
    }
    jobs
}

/// Per (field, version) status, printed unconditionally.
fn report(results: &[JobResult]) {
    for result in results {
        for field in &result.fields {
            let status = match (field.source, field.offset) {
                (FieldSource::Cached, Some(offset)) => format!("cached ({offset})"),
                (FieldSource::Cached, None) => "cached (not present)".to_string(),
                (FieldSource::Discovered, Some(offset)) => format!("discovered ({offset})"),
                (FieldSource::Discovered, None) | (FieldSource::Missing, _) => {
                    "missing".to_string()
                }
            };
            println!(
                "{}.{} @ {} (go{}): {status}",
                field.field.struct_key(),
                field.field.field,
                field.version,
                result.toolchain
            );
        }
    }
}

/// Merges every job's samples per field. Two jobs can sample the same
/// (field, version) under different toolchains; a known offset wins over
/// an absent one.
fn accumulate(
    results: &[JobResult],
) -> HashMap<WantedField, BTreeMap<Version, Option<u64>>> {
    let mut samples: HashMap<WantedField, BTreeMap<Version, Option<u64>>> = HashMap::new();
    for result in results {
        for field in &result.fields {
            let versions = samples.entry(field.field.clone()).or_default();
            match versions.get(&field.version) {
                Some(Some(_)) => {}
                _ => {
                    versions.insert(field.version.clone(), field.offset);
                }
            }
        }
    }
    samples
}
