// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! The goroutine correlator. Go's scheduler migrates goroutines across OS
//! threads at will, so per-request kernel state cannot be keyed by thread
//! id. This probe breaks on the scheduler's state-transition routine and,
//! on every transition to running, records the current thread -> goroutine
//! id pair in the pinned `goroutines` map every other probe consults.
//!
//! It is always loaded first and never emits ring records.

use crate::{
    errors::GotelError,
    types::{CallingConvention, Span},
};

use super::{FieldSpec, FunctionSpec, Probe};

pub struct GoroutinesProbe;

const FUNCTIONS: &[FunctionSpec] = &[FunctionSpec {
    symbol: "runtime.casgstatus",
    entry_program: "uprobe_casgstatus",
    return_program: None,
}];

const FIELDS: &[FieldSpec] = &[FieldSpec {
    strct: "runtime.g",
    library: "runtime",
    field: "goid",
    constant: "goid_pos",
    required: true,
}];

impl Probe for GoroutinesProbe {
    fn library_name(&self) -> &'static str {
        "runtime"
    }

    // The scheduler is entered through ABI0 shims on stack-convention
    // targets, so this probe ships a dedicated object per convention
    // instead of branching on `is_registers_abi` at run time.
    fn object_file(&self, convention: CallingConvention) -> String {
        match convention {
            CallingConvention::Registers => "goroutines_registers.o".to_string(),
            CallingConvention::Stack => "goroutines_stack.o".to_string(),
        }
    }

    fn functions(&self) -> &'static [FunctionSpec] {
        FUNCTIONS
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn mandatory(&self) -> bool {
        true
    }

    fn record_len(&self) -> Option<usize> {
        None
    }

    fn decode(&self, _record: &[u8]) -> Result<Span, GotelError> {
        Err(GotelError::Error(
            "goroutines probe emits no records".to_string(),
        ))
    }
}
