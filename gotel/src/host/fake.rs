// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! In-memory adapters for lifecycle tests: every install and removal is
//! recorded so tests can assert what the kernel would have seen.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{errors::GotelError, types::Span};

use super::{
    BreakpointHandle, KernelApi, LoadOptions, ProgramSetHandle, RingBatch, RingReader, SpanSink,
};

#[derive(Default)]
pub(crate) struct FakeKernelApi {
    next_id: u64,
    pub(crate) loaded: HashMap<u64, LoadOptions>,
    pub(crate) breakpoints: HashMap<u64, (String, u64)>,
    /// (program, addr) of every install, in order, including removed ones.
    pub(crate) install_history: Vec<(String, u64)>,
    pub(crate) removal_history: Vec<BreakpointHandle>,
    /// Probe name whose load is rejected.
    pub(crate) fail_load: Option<String>,
    /// Breakpoint address whose installation fails.
    pub(crate) fail_breakpoint_at: Option<u64>,
    /// Batches served by the next `open_ring` call.
    pub(crate) ring: Vec<Result<RingBatch, GotelError>>,
}

impl FakeKernelApi {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl KernelApi for FakeKernelApi {
    fn load_probe(
        &mut self,
        _bytecode: &[u8],
        opts: &LoadOptions,
    ) -> Result<ProgramSetHandle, GotelError> {
        if self.fail_load.as_deref() == Some(opts.probe.as_str()) {
            return Err(GotelError::ProbeLoadRejected {
                probe: opts.probe.clone(),
                reason: "verifier said no".to_string(),
            });
        }
        let id = self.next_id();
        self.loaded.insert(id, opts.clone());
        Ok(ProgramSetHandle(id))
    }

    fn install_breakpoint(
        &mut self,
        _set: ProgramSetHandle,
        program: &str,
        _exe: &Path,
        _pid: i32,
        offset: u64,
    ) -> Result<BreakpointHandle, GotelError> {
        self.install_history.push((program.to_string(), offset));
        if self.fail_breakpoint_at == Some(offset) {
            return Err(GotelError::Error(format!(
                "refusing breakpoint at {offset:#x}"
            )));
        }
        let id = self.next_id();
        self.breakpoints.insert(id, (program.to_string(), offset));
        Ok(BreakpointHandle(id))
    }

    fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<(), GotelError> {
        self.removal_history.push(handle);
        self.breakpoints
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| GotelError::Error(format!("unknown breakpoint {}", handle.0)))
    }

    fn unload(&mut self, set: ProgramSetHandle) -> Result<(), GotelError> {
        self.loaded
            .remove(&set.0)
            .map(|_| ())
            .ok_or_else(|| GotelError::Error(format!("unknown program set {}", set.0)))
    }

    fn open_ring(
        &mut self,
        _set: ProgramSetHandle,
        _map: &str,
        _page_count: usize,
    ) -> Result<Box<dyn RingReader>, GotelError> {
        Ok(Box::new(FakeRingReader {
            batches: std::mem::take(&mut self.ring).into(),
        }))
    }

    fn cleanup(&mut self, _pin_dir: &Path) -> Result<(), GotelError> {
        Ok(())
    }

    fn installed_breakpoints(&self) -> Vec<BreakpointHandle> {
        self.breakpoints.keys().map(|id| BreakpointHandle(*id)).collect()
    }
}

pub(crate) struct FakeRingReader {
    batches: VecDeque<Result<RingBatch, GotelError>>,
}

impl FakeRingReader {
    pub(crate) fn new(batches: Vec<Result<RingBatch, GotelError>>) -> Self {
        FakeRingReader {
            batches: batches.into(),
        }
    }
}

#[async_trait]
impl RingReader for FakeRingReader {
    async fn next(&mut self) -> Result<RingBatch, GotelError> {
        self.batches.pop_front().unwrap_or(Err(GotelError::RingClosed))
    }

    fn close(&mut self) {
        self.batches.clear();
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) spans: Mutex<Vec<Span>>,
}

impl SpanSink for RecordingSink {
    fn emit(&self, span: Span) -> Result<(), GotelError> {
        self.spans
            .lock()
            .map_err(|_| GotelError::Error("poisoned sink".to_string()))?
            .push(span);
        Ok(())
    }
}
