// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Probe lifecycle. The manager owns every probe instance and the event
//! pipeline; probes hold no reference back. Startup arms probes leaves
//! first (the goroutine correlator before anything keyed by goroutine id),
//! shutdown unwinds the uninstall stack in reverse.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::Arc,
};

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    analyzer,
    attach::{ProbeInstance, attach_probe},
    config::Config,
    directories::RTDIR_FS,
    errors::GotelError,
    events::EventPipeline,
    host::{KernelApi, SpanSink, TargetDiscovery},
    offsets::OffsetIndex,
    probe::Probe,
    rewrite::resolve_constants,
    types::{ProbeSpec, TargetDetails, TargetSelector},
    utils::read,
};

/// Name of the shared perf ring map every probe object declares.
const EVENTS_MAP: &str = "events";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeState {
    Loaded { breakpoints: usize },
    Disabled { reason: String },
}

#[derive(Debug, Clone)]
pub struct ProbeStatus {
    pub library: String,
    pub state: ProbeState,
}

pub struct ProbeManager {
    config: Config,
    index: Arc<OffsetIndex>,
    kernel: Box<dyn KernelApi>,
    sink: Arc<dyn SpanSink>,
    probes: Vec<Arc<dyn Probe>>,
    instances: Vec<ProbeInstance>,
    statuses: Vec<ProbeStatus>,
    pin_dir: Option<PathBuf>,
    pipeline: Option<tokio::task::JoinHandle<()>>,
    token: CancellationToken,
}

impl ProbeManager {
    pub fn new(
        config: Config,
        index: Arc<OffsetIndex>,
        kernel: Box<dyn KernelApi>,
        sink: Arc<dyn SpanSink>,
        probes: Vec<Arc<dyn Probe>>,
    ) -> Self {
        ProbeManager {
            config,
            index,
            kernel,
            sink,
            probes,
            instances: Vec::new(),
            statuses: Vec::new(),
            pin_dir: None,
            pipeline: None,
            token: CancellationToken::new(),
        }
    }

    /// Which probes loaded and which were disabled, and why.
    pub fn statuses(&self) -> &[ProbeStatus] {
        &self.statuses
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves the selector and analyzes the target binary for every
    /// function any registered probe wants.
    pub fn analyze_target(
        &self,
        discovery: &dyn TargetDiscovery,
        selector: &TargetSelector,
    ) -> Result<TargetDetails, GotelError> {
        let pid = discovery.find_pid(selector)?;
        info!("resolved {selector} to pid {pid}");
        let allocation = discovery.allocation_hint(pid)?;
        let wanted: HashSet<&str> = self
            .probes
            .iter()
            .flat_map(|p| p.functions().iter().map(|f| f.symbol))
            .collect();
        let exe_path = PathBuf::from(format!("/proc/{pid}/exe"));
        analyzer::analyze(pid, &exe_path, &wanted, allocation)
    }

    /// Arms every applicable probe and spawns the event pipeline.
    ///
    /// A probe whose instrumented functions are not all present in the
    /// target is disabled with a warning; failures of optional probes
    /// disable just that probe. A mandatory probe failing is fatal, with
    /// already-armed probes left for [`shutdown`](Self::shutdown) to
    /// unwind.
    pub async fn start(&mut self, details: &TargetDetails) -> Result<(), GotelError> {
        let convention = analyzer::calling_convention(&details.go_version)?;
        info!(
            "target pid {} built with go{} ({convention} calling convention)",
            details.pid, details.go_version
        );

        let pin_dir = PathBuf::from(RTDIR_FS).join(details.pid.to_string());
        self.pin_dir = Some(pin_dir.clone());
        let settings = self.config.probes();

        for probe in self.probes.clone() {
            let library = probe.library_name().to_string();

            if let Some(missing) = probe
                .functions()
                .iter()
                .find(|f| details.function(f.symbol).is_none())
            {
                let reason = format!("function {} not found in target", missing.symbol);
                if probe.mandatory() {
                    return Err(GotelError::ProbeLoadRejected {
                        probe: library,
                        reason,
                    });
                }
                warn!("disabling {library}: {reason}");
                self.statuses.push(ProbeStatus {
                    library,
                    state: ProbeState::Disabled { reason },
                });
                continue;
            }

            let armed = self.arm_probe(&probe, details, convention, &pin_dir);
            match armed {
                Ok(instance) => {
                    info!(
                        "loaded {library} ({} breakpoints)",
                        instance.breakpoints.len()
                    );
                    self.statuses.push(ProbeStatus {
                        library,
                        state: ProbeState::Loaded {
                            breakpoints: instance.breakpoints.len(),
                        },
                    });
                    self.instances.push(instance);
                }
                Err(e) if probe.mandatory() => return Err(e),
                Err(e) => {
                    warn!("disabling {library}: {e}");
                    self.statuses.push(ProbeStatus {
                        library,
                        state: ProbeState::Disabled {
                            reason: e.to_string(),
                        },
                    });
                }
            }
        }

        let Some(first) = self.instances.first() else {
            return Err(GotelError::Error(
                "no probe could be armed against this target".to_string(),
            ));
        };

        // The ring is shared by name across all probe objects; any armed
        // set can hand it out. Opened exactly once.
        let reader = self
            .kernel
            .open_ring(first.set, EVENTS_MAP, settings.perf_pages)?;
        let enabled: Vec<Arc<dyn Probe>> =
            self.instances.iter().map(|i| Arc::clone(&i.probe)).collect();
        let pipeline = EventPipeline::new(reader, &enabled, Arc::clone(&self.sink))?;
        let token = self.token.clone();
        self.pipeline = Some(tokio::spawn(pipeline.run(token)));
        Ok(())
    }

    fn arm_probe(
        &mut self,
        probe: &Arc<dyn Probe>,
        details: &TargetDetails,
        convention: crate::types::CallingConvention,
        pin_dir: &std::path::Path,
    ) -> Result<ProbeInstance, GotelError> {
        let constants = resolve_constants(probe.as_ref(), details, convention, &self.index)?;
        let object = probe.object_file(convention);
        let settings = self.config.probes();
        let bytecode = read(settings.bytecode_dir.join(&object))?;
        let spec = ProbeSpec {
            name: object,
            bytecode,
        };
        attach_probe(
            self.kernel.as_mut(),
            Arc::clone(probe),
            &spec,
            constants,
            details,
            pin_dir,
            &settings,
        )
    }

    /// Tears everything down: cancel, close and drain the ring, remove
    /// breakpoints in reverse installation order, unload programs, drop
    /// the PID-scoped pin directory.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.await {
                error!("event pipeline panicked: {e}");
            }
        }

        for mut instance in self.instances.drain(..).rev() {
            for breakpoint in instance.breakpoints.drain(..).rev() {
                if let Err(e) = self.kernel.remove_breakpoint(breakpoint) {
                    error!("failed to remove breakpoint: {e}");
                }
            }
            if let Err(e) = self.kernel.unload(instance.set) {
                error!("failed to unload probe {}: {e}", instance.probe.library_name());
            }
        }

        if let Some(pin_dir) = self.pin_dir.take() {
            if let Err(e) = self.kernel.cleanup(&pin_dir) {
                error!("failed to clean pin directory: {e}");
            }
        }

        let leftover = self.kernel.installed_breakpoints();
        if !leftover.is_empty() {
            error!("{} breakpoints survived shutdown", leftover.len());
        }
    }
}
