// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Read-only analysis of the target's on-disk executable: toolchain
//! version, calling convention, linked modules, and the entry/return
//! addresses of every function the probes want to instrument. The target
//! process itself is never touched.

pub mod buildinfo;
pub mod disasm;

use std::{collections::HashSet, path::Path};

use log::{debug, warn};
use object::{Object, ObjectSection, ObjectSymbol, SectionKind};
use semver::Version;

use crate::{
    errors::GotelError,
    types::{AllocationHint, CallingConvention, FunctionInfo, TargetDetails},
    utils::read,
};
pub use disasm::Arch;

/// Oldest Go release gotel understands. Binaries below this predate the
/// runtime tables the probes rely on.
pub const MIN_GO_VERSION: Version = Version::new(1, 12, 0);

/// First release where arguments travel in registers (ABIInternal).
const REGISTERS_ABI_SINCE: Version = Version::new(1, 17, 0);

/// Selects the calling convention for a toolchain version.
pub fn calling_convention(version: &Version) -> Result<CallingConvention, GotelError> {
    if *version < MIN_GO_VERSION {
        return Err(GotelError::CallingConventionUnknown(version.clone()));
    }
    if *version >= REGISTERS_ABI_SINCE {
        Ok(CallingConvention::Registers)
    } else {
        Ok(CallingConvention::Stack)
    }
}

/// Analyzes the executable behind `pid` and discovers every function in
/// `wanted`. Symbols absent from the binary are simply not reported;
/// deciding what that means for a probe is the manager's call.
pub fn analyze(
    pid: i32,
    exe_path: &Path,
    wanted: &HashSet<&str>,
    allocation: Option<AllocationHint>,
) -> Result<TargetDetails, GotelError> {
    let display_path = exe_path.display().to_string();
    let data = read(exe_path)?;
    let file = object::File::parse(&*data).map_err(|e| GotelError::NotAGoBinary {
        path: display_path.clone(),
        reason: format!("not a parseable executable: {e}"),
    })?;

    let arch = match file.architecture() {
        object::Architecture::X86_64 => Arch::X86_64,
        object::Architecture::Aarch64 => Arch::Aarch64,
        other => return Err(GotelError::UnsupportedArchitecture(other)),
    };

    let info = buildinfo::read_build_info(&display_path, &file)?;
    debug!(
        "target {pid} built with go{} linking {} modules",
        info.go_version,
        info.libraries.len()
    );

    if file.symbols().next().is_none() {
        return Err(GotelError::NotAGoBinary {
            path: display_path,
            reason: "symbol table stripped".to_string(),
        });
    }

    let functions = find_functions(&file, arch, wanted)?;
    debug!(
        "found {} of {} wanted functions in {display_path}",
        functions.len(),
        wanted.len()
    );

    Ok(TargetDetails {
        pid,
        exe_path: exe_path.to_path_buf(),
        go_version: info.go_version,
        libraries: info.libraries,
        functions,
        allocation,
    })
}

/// Walks the symbol table for wanted names and derives, per function, the
/// file offset of its entry and of every return instruction.
fn find_functions(
    file: &object::File,
    arch: Arch,
    wanted: &HashSet<&str>,
) -> Result<Vec<FunctionInfo>, GotelError> {
    let mut functions = Vec::new();
    for symbol in file.symbols() {
        let Ok(name) = symbol.name() else {
            continue;
        };
        if !wanted.contains(name) {
            continue;
        }
        let address = symbol.address();
        let size = symbol.size();
        if size == 0 {
            warn!("symbol {name} has no size, skipping");
            continue;
        }

        let section = file
            .sections()
            .filter(|s| s.kind() == SectionKind::Text)
            .find(|s| {
                address >= s.address() && address + size <= s.address() + s.size()
            })
            .ok_or_else(|| GotelError::SymbolOutsideExecutableSegments {
                symbol: name.to_string(),
                address,
            })?;

        let (section_file_start, _) = section.file_range().ok_or_else(|| {
            GotelError::SymbolOutsideExecutableSegments {
                symbol: name.to_string(),
                address,
            }
        })?;
        let rel = (address - section.address()) as usize;
        let section_data =
            section
                .data()
                .map_err(|e| GotelError::SymbolOutsideExecutableSegments {
                    symbol: format!("{name} ({e})"),
                    address,
                })?;
        let code = &section_data[rel..rel + size as usize];

        let entry_offset = section_file_start + address - section.address();
        let return_offsets = disasm::return_offsets(arch, name, code)?
            .into_iter()
            .map(|r| entry_offset + r)
            .collect();

        functions.push(FunctionInfo::new(
            name.to_string(),
            entry_offset,
            return_offsets,
        )?);
    }
    functions.sort_by_key(|f| f.entry_offset);
    Ok(functions)
}
