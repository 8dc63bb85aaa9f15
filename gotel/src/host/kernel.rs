// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! aya-backed kernel adapter. Owns every loaded program set and installed
//! uprobe link; dropping a link detaches the breakpoint, dropping a
//! program set unloads its programs and maps.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use aya::{
    Ebpf, EbpfLoader, VerifierLogLevel,
    maps::perf::PerfEventArray,
    programs::{UProbe, uprobe::UProbeLink},
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::errors::GotelError;

use super::{
    BreakpointHandle, KernelApi, LoadOptions, ProgramSetHandle, RingBatch, RingReader,
};

const RING_SCRATCH_SLOTS: usize = 16;
const RING_SCRATCH_BYTES: usize = 64 * 1024;
const RING_IDLE_SLEEP: Duration = Duration::from_millis(5);

#[derive(Default)]
pub struct AyaKernelApi {
    next_id: u64,
    sets: HashMap<u64, Ebpf>,
    links: HashMap<u64, UProbeLink>,
}

impl AyaKernelApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn uprobe_mut<'a>(
        ebpf: &'a mut Ebpf,
        program: &str,
    ) -> Result<&'a mut UProbe, GotelError> {
        let prog = ebpf
            .program_mut(program)
            .ok_or_else(|| GotelError::Error(format!("program {program} not found in object")))?;
        Ok(prog.try_into()?)
    }
}

impl KernelApi for AyaKernelApi {
    fn load_probe(
        &mut self,
        bytecode: &[u8],
        opts: &LoadOptions,
    ) -> Result<ProgramSetHandle, GotelError> {
        let mut loader = EbpfLoader::new();
        loader.allow_unsupported_maps();
        // Shared maps are pinned by name under the PID-scoped directory;
        // the loader reuses an existing pin instead of creating a second
        // map.
        loader.map_pin_path(&opts.pin_dir);
        if opts.verifier_log {
            loader.verifier_log_level(VerifierLogLevel::VERBOSE);
        }
        if let Some(max) = opts.max_inflight {
            loader.set_max_entries("inflight", max);
        }
        for (name, value) in opts.constants.iter() {
            loader.set_global(name, value.as_slice(), true);
        }

        let mut ebpf = loader
            .load(bytecode)
            .map_err(|e| GotelError::ProbeLoadRejected {
                probe: opts.probe.clone(),
                reason: e.to_string(),
            })?;

        for program in &opts.programs {
            let uprobe = Self::uprobe_mut(&mut ebpf, program).map_err(|e| {
                GotelError::ProbeLoadRejected {
                    probe: opts.probe.clone(),
                    reason: e.to_string(),
                }
            })?;
            uprobe.load().map_err(|e| GotelError::ProbeLoadRejected {
                probe: opts.probe.clone(),
                reason: e.to_string(),
            })?;
        }

        let id = self.next_id();
        debug!("loaded probe {} as program set {id}", opts.probe);
        self.sets.insert(id, ebpf);
        Ok(ProgramSetHandle(id))
    }

    fn install_breakpoint(
        &mut self,
        set: ProgramSetHandle,
        program: &str,
        exe: &Path,
        pid: i32,
        offset: u64,
    ) -> Result<BreakpointHandle, GotelError> {
        let id = self.next_id();
        let ebpf = self
            .sets
            .get_mut(&set.0)
            .ok_or_else(|| GotelError::Error(format!("unknown program set {}", set.0)))?;
        let uprobe = Self::uprobe_mut(ebpf, program)?;
        let link_id = uprobe
            .attach(None, offset, exe, Some(pid))
            .map_err(|e| GotelError::BreakpointInstallFailed {
                addr: offset,
                source: e,
            })?;
        let link = uprobe
            .take_link(link_id)
            .map_err(|e| GotelError::BreakpointInstallFailed {
                addr: offset,
                source: e,
            })?;
        self.links.insert(id, link);
        Ok(BreakpointHandle(id))
    }

    fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<(), GotelError> {
        // Dropping the owned link detaches the uprobe.
        self.links
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| GotelError::Error(format!("unknown breakpoint {}", handle.0)))
    }

    fn unload(&mut self, set: ProgramSetHandle) -> Result<(), GotelError> {
        self.sets
            .remove(&set.0)
            .map(|_| ())
            .ok_or_else(|| GotelError::Error(format!("unknown program set {}", set.0)))
    }

    fn open_ring(
        &mut self,
        set: ProgramSetHandle,
        map: &str,
        page_count: usize,
    ) -> Result<Box<dyn RingReader>, GotelError> {
        let ebpf = self
            .sets
            .get_mut(&set.0)
            .ok_or_else(|| GotelError::Error(format!("unknown program set {}", set.0)))?;
        let events_map = ebpf
            .take_map(map)
            .ok_or_else(|| GotelError::Error(format!("map {map} not found in program set")))?;
        let mut events = PerfEventArray::try_from(events_map)?;

        let mut buffers = Vec::new();
        for cpu in online_cpus().map_err(|(_, e)| GotelError::RingReadFailed(e))? {
            buffers.push(
                events
                    .open(cpu, Some(page_count))
                    .map_err(|e| GotelError::RingReadFailed(std::io::Error::other(e)))?,
            );
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(64);
        let thread_stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut scratch: Vec<BytesMut> = (0..RING_SCRATCH_SLOTS)
                .map(|_| BytesMut::with_capacity(RING_SCRATCH_BYTES))
                .collect();
            while !thread_stop.load(Ordering::Relaxed) {
                let mut idle = true;
                for buffer in buffers.iter_mut() {
                    if !buffer.readable() {
                        continue;
                    }
                    let batch = match buffer.read_events(&mut scratch) {
                        Ok(events) => {
                            if events.read == 0 && events.lost == 0 {
                                continue;
                            }
                            idle = false;
                            Ok(RingBatch {
                                records: scratch
                                    .iter()
                                    .take(events.read)
                                    .map(|b| b[..].to_vec())
                                    .collect(),
                                lost: events.lost as u64,
                            })
                        }
                        Err(e) => Err(GotelError::RingReadFailed(std::io::Error::other(e))),
                    };
                    if tx.blocking_send(batch).is_err() {
                        return;
                    }
                }
                if idle {
                    thread::sleep(RING_IDLE_SLEEP);
                }
            }
        });

        Ok(Box::new(PerfRingReader { rx, stop }))
    }

    fn cleanup(&mut self, pin_dir: &Path) -> Result<(), GotelError> {
        match std::fs::remove_dir_all(pin_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("failed to remove pin directory {}: {e}", pin_dir.display());
                Err(e.into())
            }
        }
    }

    fn installed_breakpoints(&self) -> Vec<BreakpointHandle> {
        self.links.keys().map(|id| BreakpointHandle(*id)).collect()
    }
}

struct PerfRingReader {
    rx: mpsc::Receiver<Result<RingBatch, GotelError>>,
    stop: Arc<AtomicBool>,
}

#[async_trait]
impl RingReader for PerfRingReader {
    async fn next(&mut self) -> Result<RingBatch, GotelError> {
        match self.rx.recv().await {
            Some(batch) => batch,
            None => Err(GotelError::RingClosed),
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.rx.close();
    }
}

impl Drop for PerfRingReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
