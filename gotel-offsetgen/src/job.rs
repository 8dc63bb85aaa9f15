// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! One generation job: a (manifest, app-version, toolchain) triple.

use std::collections::HashMap;

use log::{debug, warn};
use semver::Version;
use tempfile::TempDir;

use crate::{
    builder::build_in_container,
    cache::OffsetCache,
    errors::GenError,
    manifest::{Manifest, WantedField},
    render::render_app,
};

#[derive(Debug, Clone)]
pub struct Job {
    pub manifest: Manifest,
    pub toolchain: Version,
    /// The version the samples are recorded at; equal to `toolchain` for
    /// standard-library manifests.
    pub app_version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Cached,
    Discovered,
    Missing,
}

#[derive(Debug, Clone)]
pub struct FieldResult {
    pub field: WantedField,
    pub version: Version,
    pub offset: Option<u64>,
    pub source: FieldSource,
}

#[derive(Debug)]
pub struct JobResult {
    pub toolchain: Version,
    pub fields: Vec<FieldResult>,
}

/// Runs one job: cache check, render, sandboxed build, DWARF read. A
/// failed build is reportable but non-fatal; every uncached field of the
/// job is then recorded as absent at this version.
pub async fn run_job(job: &Job, cache: &OffsetCache) -> Result<JobResult, GenError> {
    let mut fields = Vec::new();
    let mut misses = Vec::new();
    for field in &job.manifest.wanted {
        match cache.get(&job.toolchain, &job.app_version, field)? {
            Some(offset) => fields.push(FieldResult {
                field: field.clone(),
                version: job.app_version.clone(),
                offset,
                source: FieldSource::Cached,
            }),
            None => misses.push(field.clone()),
        }
    }

    if misses.is_empty() {
        debug!(
            "{} {} on go{}: fully cached",
            job.manifest.name, job.app_version, job.toolchain
        );
        return Ok(result(job, fields));
    }
    debug!(
        "{} {} on go{}: {} uncached fields",
        job.manifest.name,
        job.app_version,
        job.toolchain,
        misses.len()
    );

    let workdir = TempDir::new()?;
    render_app(workdir.path(), &job.manifest, &job.app_version, &job.toolchain)?;

    let extracted = match build_in_container(workdir.path(), &job.toolchain).await {
        Ok(binary) => {
            let bytes = std::fs::read(&binary)?;
            dwarf_offsets(&binary.display().to_string(), &bytes, &misses)?
        }
        Err(e @ GenError::ContainerBuildFailed { .. }) => {
            warn!(
                "{} {} on go{}: {e}; marking {} fields not present at this version",
                job.manifest.name,
                job.app_version,
                job.toolchain,
                misses.len()
            );
            misses.iter().map(|f| (f.clone(), None)).collect()
        }
        Err(e) => return Err(e),
    };

    for field in misses {
        let offset = extracted.get(&field).copied().flatten();
        cache.put(&job.toolchain, &job.app_version, &field, offset)?;
        fields.push(FieldResult {
            field,
            version: job.app_version.clone(),
            offset,
            source: if offset.is_some() {
                FieldSource::Discovered
            } else {
                FieldSource::Missing
            },
        });
    }

    Ok(result(job, fields))
}

fn dwarf_offsets(
    path: &str,
    bytes: &[u8],
    misses: &[WantedField],
) -> Result<HashMap<WantedField, Option<u64>>, GenError> {
    crate::dwarf::extract_offsets(path, bytes, misses)
}

fn result(job: &Job, fields: Vec<FieldResult>) -> JobResult {
    JobResult {
        toolchain: job.toolchain.clone(),
        fields,
    }
}
