// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Constant relocation. Probe bytecode is compiled against symbolic
//! constants (field offsets, ABI flag, allocation bounds); this module
//! resolves their values for the concrete target so the loader can
//! overwrite the probe's read-only data before the kernel verifies it.

use std::collections::HashMap;

use log::warn;

use crate::{
    errors::GotelError,
    offsets::OffsetIndex,
    probe::Probe,
    types::{CallingConvention, TargetDetails},
};

/// Well-known relocation points every probe declares.
pub const IS_REGISTERS_ABI: &str = "is_registers_abi";
pub const TOTAL_CPUS: &str = "total_cpus";
pub const START_ADDR: &str = "start_addr";
pub const END_ADDR: &str = "end_addr";

/// Resolved constant values keyed by relocation-point name. Inserting an
/// existing key overwrites it: last write wins.
#[derive(Debug, Clone, Default)]
pub struct ProbeConstants {
    values: HashMap<String, Vec<u8>>,
}

impl ProbeConstants {
    pub fn insert(&mut self, name: &str, value: Vec<u8>) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Builds the constants map for one probe against one target.
///
/// Field offsets are looked up at the version of the owning library as
/// linked into the target. A missing offset for a required field fails the
/// probe; optional fields are omitted and the bytecode's baked-in default
/// stands. Offsets are injected as native-endian u64, `is_registers_abi`
/// as a single byte, allocation bounds as u64 with a u32 cpu count,
/// matching the declared sizes in the probe objects.
pub fn resolve_constants(
    probe: &dyn Probe,
    details: &TargetDetails,
    convention: CallingConvention,
    index: &OffsetIndex,
) -> Result<ProbeConstants, GotelError> {
    let mut constants = ProbeConstants::default();
    constants.insert(
        IS_REGISTERS_ABI,
        vec![u8::from(convention == CallingConvention::Registers)],
    );

    for field in probe.fields() {
        let version = match details.library_version(field.library) {
            Some(v) => v.clone(),
            None => {
                if field.required {
                    return Err(GotelError::OffsetMissing {
                        strct: field.strct.to_string(),
                        field: field.field.to_string(),
                        version: details.go_version.clone(),
                    });
                }
                warn!(
                    "{}: version of {} unknown, omitting optional {}.{}",
                    probe.library_name(),
                    field.library,
                    field.strct,
                    field.field
                );
                continue;
            }
        };
        match index.lookup(field.strct, field.field, &version) {
            Some(offset) => {
                constants.insert(field.constant, offset.to_ne_bytes().to_vec());
            }
            None if field.required => {
                return Err(GotelError::OffsetMissing {
                    strct: field.strct.to_string(),
                    field: field.field.to_string(),
                    version,
                });
            }
            None => {
                warn!(
                    "{}: no offset for optional {}.{} at {version}, omitting",
                    probe.library_name(),
                    field.strct,
                    field.field
                );
            }
        }
    }

    if probe.needs_allocation() {
        let hint = details.allocation.ok_or_else(|| GotelError::Error(format!(
            "probe {} requires allocation details but none were discovered",
            probe.library_name()
        )))?;
        constants.insert(TOTAL_CPUS, hint.ncpus.to_ne_bytes().to_vec());
        constants.insert(START_ADDR, hint.start_addr.to_ne_bytes().to_vec());
        constants.insert(END_ADDR, hint.end_addr.to_ne_bytes().to_vec());
    }

    Ok(constants)
}
