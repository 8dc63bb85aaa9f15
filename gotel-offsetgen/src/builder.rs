// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Sandboxed builds. Each job compiles inside a container image pinned to
//! the job's toolchain; the work directory is bind-mounted so the produced
//! binary can be read back from the host.

use std::path::{Path, PathBuf};

use log::debug;
use semver::Version;
use tokio::process::Command;

use crate::errors::GenError;

const CONTAINER_RUNTIME: &str = "docker";
const BINARY_NAME: &str = "app";

/// Resolves dependencies and builds the rendered program with the pinned
/// toolchain. Returns the path of the produced binary on the host.
///
/// A non-zero exit from either step is a reportable
/// [`GenError::ContainerBuildFailed`]; the caller marks the job's fields
/// absent and moves on.
pub async fn build_in_container(workdir: &Path, toolchain: &Version) -> Result<PathBuf, GenError> {
    let image = format!("golang:{toolchain}");
    run_step(workdir, &image, &["go", "mod", "tidy"]).await?;
    run_step(workdir, &image, &["go", "build", "-o", BINARY_NAME, "."]).await?;
    Ok(workdir.join(BINARY_NAME))
}

async fn run_step(workdir: &Path, image: &str, step: &[&str]) -> Result<(), GenError> {
    debug!("{image}: running {step:?} in {}", workdir.display());
    let output = Command::new(CONTAINER_RUNTIME)
        .arg("run")
        .arg("--rm")
        .arg("-v")
        .arg(format!("{}:/app", workdir.display()))
        .arg("-w")
        .arg("/app")
        .arg(image)
        .args(step)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(GenError::ContainerBuildFailed {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            rc: output.status.code().unwrap_or(-1),
        });
    }
    Ok(())
}
