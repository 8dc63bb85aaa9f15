// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenError {
    #[error("An error occurred. {0}")]
    Error(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("container build failed (exit {rc})\nstdout: {stdout}\nstderr: {stderr}")]
    ContainerBuildFailed {
        stdout: String,
        stderr: String,
        rc: i32,
    },
    #[error("offset cache is corrupt: {0}")]
    CacheCorrupt(String),
    #[error("{0}: not a readable binary: {1}")]
    BinaryUnreadable(String, String),
    #[error("failed to read debug info: {0}")]
    DwarfError(#[from] gimli::Error),
}
