// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! The external-collaborator boundary. Everything platform-specific
//! (kernel program loading, process discovery, span export) sits behind
//! the narrow traits in this module; the rest of the crate is portable
//! logic over them.

pub mod discovery;
pub mod kernel;
pub mod otlp;

#[cfg(test)]
pub(crate) mod fake;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{
    errors::GotelError,
    rewrite::ProbeConstants,
    types::{AllocationHint, Span, TargetSelector},
};

/// A loaded probe bytecode unit (programs plus maps) in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramSetHandle(pub u64);

/// One installed user-space breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakpointHandle(pub u64);

/// Everything the kernel adapter needs to load one probe.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Probe name, for diagnostics.
    pub probe: String,
    /// PID-scoped directory on bpffs where shared maps are pinned and
    /// reused by name.
    pub pin_dir: PathBuf,
    /// Relocated constants overwriting the probe's read-only data.
    pub constants: ProbeConstants,
    /// Names of the programs inside the object to load.
    pub programs: Vec<String>,
    /// Override for the probe's in-flight request map capacity.
    pub max_inflight: Option<u32>,
    /// Request a verbose verifier log and print it on rejection.
    pub verifier_log: bool,
}

/// Records read out of the shared ring, plus the kernel's count of
/// samples dropped since the previous read.
#[derive(Debug, Default)]
pub struct RingBatch {
    pub records: Vec<Vec<u8>>,
    pub lost: u64,
}

/// Single consumer over the shared perf ring.
#[async_trait]
pub trait RingReader: Send {
    /// Waits for the next batch. Fails with [`GotelError::RingClosed`]
    /// once the ring is closed and drained.
    async fn next(&mut self) -> Result<RingBatch, GotelError>;

    /// Closes the ring; pending `next` calls observe end of stream.
    fn close(&mut self);
}

/// Kernel-facing operations: program/map load, breakpoint installation,
/// ring access, pin cleanup.
pub trait KernelApi: Send {
    fn load_probe(
        &mut self,
        bytecode: &[u8],
        opts: &LoadOptions,
    ) -> Result<ProgramSetHandle, GotelError>;

    fn install_breakpoint(
        &mut self,
        set: ProgramSetHandle,
        program: &str,
        exe: &Path,
        pid: i32,
        offset: u64,
    ) -> Result<BreakpointHandle, GotelError>;

    fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<(), GotelError>;

    fn unload(&mut self, set: ProgramSetHandle) -> Result<(), GotelError>;

    /// Opens the shared ring backed by `map` inside `set`. Called once per
    /// process lifetime.
    fn open_ring(
        &mut self,
        set: ProgramSetHandle,
        map: &str,
        page_count: usize,
    ) -> Result<Box<dyn RingReader>, GotelError>;

    /// Removes the PID-scoped pin directory and everything in it.
    fn cleanup(&mut self, pin_dir: &Path) -> Result<(), GotelError>;

    /// Currently installed breakpoints; shutdown asserts this drains.
    fn installed_breakpoints(&self) -> Vec<BreakpointHandle>;
}

/// Resolves the user's target selector to a process.
pub trait TargetDiscovery: Send {
    fn find_pid(&self, selector: &TargetSelector) -> Result<i32, GotelError>;

    fn allocation_hint(&self, pid: i32) -> Result<Option<AllocationHint>, GotelError>;
}

/// Receives completed spans. Batching and retries are the sink's problem.
pub trait SpanSink: Send + Sync {
    fn emit(&self, span: Span) -> Result<(), GotelError>;
}
