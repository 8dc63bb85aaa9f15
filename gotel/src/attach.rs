// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Probe attachment. Loads relocated bytecode, pins shared maps under the
//! PID-scoped directory, and installs a breakpoint at the entry and every
//! return site of each instrumented function. A failure after partial
//! installation unwinds this probe completely; other probes are untouched.

use std::{path::Path, sync::Arc};

use log::{debug, error};

use crate::{
    config::ProbeSettings,
    errors::GotelError,
    host::{BreakpointHandle, KernelApi, LoadOptions, ProgramSetHandle},
    probe::Probe,
    rewrite::ProbeConstants,
    types::{ProbeSpec, TargetDetails},
};

/// A fully armed probe: its kernel program set plus every breakpoint, in
/// installation order.
pub struct ProbeInstance {
    pub probe: Arc<dyn Probe>,
    pub set: ProgramSetHandle,
    pub breakpoints: Vec<BreakpointHandle>,
}

/// Arms one probe against the target.
pub fn attach_probe(
    kernel: &mut dyn KernelApi,
    probe: Arc<dyn Probe>,
    spec: &ProbeSpec,
    constants: ProbeConstants,
    details: &TargetDetails,
    pin_dir: &Path,
    settings: &ProbeSettings,
) -> Result<ProbeInstance, GotelError> {
    let programs = probe
        .functions()
        .iter()
        .flat_map(|f| {
            std::iter::once(f.entry_program).chain(f.return_program)
        })
        .map(str::to_string)
        .collect();

    let opts = LoadOptions {
        probe: spec.name.clone(),
        pin_dir: pin_dir.to_path_buf(),
        constants,
        programs,
        max_inflight: Some(settings.max_inflight),
        verifier_log: settings.verifier_log,
    };
    let set = kernel.load_probe(&spec.bytecode, &opts)?;

    let mut breakpoints: Vec<BreakpointHandle> = Vec::new();
    let result = install_breakpoints(kernel, &probe, set, details, &mut breakpoints);
    if let Err(e) = result {
        error!(
            "rolling back {} after partial installation: {e}",
            probe.library_name()
        );
        for handle in breakpoints.into_iter().rev() {
            if let Err(remove_err) = kernel.remove_breakpoint(handle) {
                error!("rollback of breakpoint failed: {remove_err}");
            }
        }
        if let Err(unload_err) = kernel.unload(set) {
            error!("rollback unload failed: {unload_err}");
        }
        return Err(e);
    }

    debug!(
        "armed {} with {} breakpoints",
        probe.library_name(),
        breakpoints.len()
    );
    Ok(ProbeInstance {
        probe,
        set,
        breakpoints,
    })
}

fn install_breakpoints(
    kernel: &mut dyn KernelApi,
    probe: &Arc<dyn Probe>,
    set: ProgramSetHandle,
    details: &TargetDetails,
    installed: &mut Vec<BreakpointHandle>,
) -> Result<(), GotelError> {
    for function in probe.functions() {
        let info = details.function(function.symbol).ok_or_else(|| {
            GotelError::Error(format!(
                "function {} not discovered in target",
                function.symbol
            ))
        })?;

        installed.push(kernel.install_breakpoint(
            set,
            function.entry_program,
            &details.exe_path,
            details.pid,
            info.entry_offset,
        )?);

        if let Some(return_program) = function.return_program {
            for offset in &info.return_offsets {
                installed.push(kernel.install_breakpoint(
                    set,
                    return_program,
                    &details.exe_path,
                    details.pid,
                    *offset,
                )?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use semver::Version;

    use crate::{
        host::fake::FakeKernelApi,
        probe::net_http::HttpServerProbe,
        types::FunctionInfo,
    };

    use super::*;

    fn details() -> TargetDetails {
        TargetDetails {
            pid: 7,
            exe_path: "/proc/7/exe".into(),
            go_version: Version::new(1, 21, 0),
            libraries: HashMap::new(),
            functions: vec![
                FunctionInfo::new(
                    "net/http.serverHandler.ServeHTTP".to_string(),
                    0x1000,
                    vec![0x1040, 0x1080],
                )
                .unwrap(),
            ],
            allocation: None,
        }
    }

    fn spec() -> ProbeSpec {
        ProbeSpec {
            name: "net_http_server.o".to_string(),
            bytecode: vec![0x7f, 0x45, 0x4c, 0x46],
        }
    }

    fn settings() -> ProbeSettings {
        ProbeSettings::default()
    }

    #[test]
    fn test_attach_installs_entry_and_every_return() {
        let mut kernel = FakeKernelApi::default();
        let instance = attach_probe(
            &mut kernel,
            Arc::new(HttpServerProbe),
            &spec(),
            ProbeConstants::default(),
            &details(),
            Path::new("/run/gotel/fs/7"),
            &settings(),
        )
        .unwrap();

        assert_eq!(instance.breakpoints.len(), 3);
        assert_eq!(
            kernel.install_history,
            vec![
                ("uprobe_serve_http".to_string(), 0x1000),
                ("uprobe_serve_http_ret".to_string(), 0x1040),
                ("uprobe_serve_http_ret".to_string(), 0x1080),
            ]
        );
    }

    #[test]
    fn test_partial_failure_rolls_back_in_reverse() {
        let mut kernel = FakeKernelApi::default();
        kernel.fail_breakpoint_at = Some(0x1080);

        let result = attach_probe(
            &mut kernel,
            Arc::new(HttpServerProbe),
            &spec(),
            ProbeConstants::default(),
            &details(),
            Path::new("/run/gotel/fs/7"),
            &settings(),
        );

        assert!(result.is_err());
        // Both successfully installed breakpoints were removed, newest
        // first, and the program set was unloaded.
        assert!(kernel.breakpoints.is_empty());
        assert!(kernel.loaded.is_empty());
        assert_eq!(kernel.removal_history.len(), 2);
        assert!(kernel.removal_history[0].0 > kernel.removal_history[1].0);
    }

    #[test]
    fn test_missing_function_fails_before_loading_breakpoints() {
        let mut kernel = FakeKernelApi::default();
        let mut target = details();
        target.functions.clear();

        assert!(
            attach_probe(
                &mut kernel,
                Arc::new(HttpServerProbe),
                &spec(),
                ProbeConstants::default(),
                &target,
                Path::new("/run/gotel/fs/7"),
                &settings(),
            )
            .is_err()
        );
        assert!(kernel.breakpoints.is_empty());
    }
}
