// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! procfs-backed target discovery.

use log::debug;
use procfs::Current;
use procfs::process::{Process, all_processes};

use crate::{
    errors::GotelError,
    types::{AllocationHint, TargetSelector},
};

use super::TargetDiscovery;

/// Size of the scratch region probes may carve above the target's highest
/// mapping.
const ALLOC_REGION_BYTES: u64 = 16 * 1024 * 1024;
const PAGE: u64 = 4096;

pub struct ProcfsDiscovery;

impl TargetDiscovery for ProcfsDiscovery {
    fn find_pid(&self, selector: &TargetSelector) -> Result<i32, GotelError> {
        match selector {
            TargetSelector::Pid(pid) => {
                Process::new(*pid)
                    .map_err(|e| GotelError::Error(format!("no such process {pid}: {e}")))?;
                Ok(*pid)
            }
            TargetSelector::ExeName(name) => {
                let processes = all_processes()
                    .map_err(|e| GotelError::Error(format!("cannot list processes: {e}")))?;
                for process in processes.flatten() {
                    let Ok(exe) = process.exe() else {
                        continue;
                    };
                    if exe.file_name().is_some_and(|f| f == name.as_str()) {
                        debug!("resolved {name} to pid {}", process.pid());
                        return Ok(process.pid());
                    }
                }
                Err(GotelError::Error(format!(
                    "no running process with executable \"{name}\""
                )))
            }
        }
    }

    fn allocation_hint(&self, pid: i32) -> Result<Option<AllocationHint>, GotelError> {
        let process = Process::new(pid)
            .map_err(|e| GotelError::Error(format!("no such process {pid}: {e}")))?;
        let maps = match process.maps() {
            Ok(maps) => maps,
            Err(e) => {
                debug!("cannot read maps of {pid}: {e}");
                return Ok(None);
            }
        };
        let Some(top) = maps.into_iter().map(|m| m.address.1).max() else {
            return Ok(None);
        };
        let ncpus = procfs::CpuInfo::current()
            .map_err(|e| GotelError::Error(format!("cannot read cpuinfo: {e}")))?
            .num_cores() as u32;

        let start_addr = top.div_ceil(PAGE) * PAGE;
        Ok(Some(AllocationHint {
            start_addr,
            end_addr: start_addr + ALLOC_REGION_BYTES,
            ncpus,
        }))
    }
}
