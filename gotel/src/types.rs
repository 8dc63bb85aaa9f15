// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use std::{collections::HashMap, fmt, path::PathBuf};

use opentelemetry::{KeyValue, trace::SpanKind};
use semver::Version;

use crate::errors::GotelError;

/// Whether the target passes function arguments on the stack (ABI0) or in
/// registers (ABIInternal, go >= 1.17).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    Stack,
    Registers,
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::Stack => write!(f, "stack"),
            CallingConvention::Registers => write!(f, "registers"),
        }
    }
}

/// One instrumented function discovered in the target binary. Offsets are
/// file offsets into the executable, suitable for uprobe attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub symbol: String,
    pub entry_offset: u64,
    pub return_offsets: Vec<u64>,
}

impl FunctionInfo {
    /// Builds a `FunctionInfo`, enforcing that the entry precedes every
    /// return and that return offsets are strictly ascending.
    pub fn new(
        symbol: String,
        entry_offset: u64,
        return_offsets: Vec<u64>,
    ) -> Result<Self, GotelError> {
        let ascending = return_offsets.windows(2).all(|w| w[0] < w[1]);
        let after_entry = return_offsets.iter().all(|r| *r > entry_offset);
        if !ascending || !after_entry {
            return Err(GotelError::Error(format!(
                "inconsistent return offsets for {symbol}: entry {entry_offset:#x}, returns {return_offsets:x?}"
            )));
        }
        Ok(FunctionInfo {
            symbol,
            entry_offset,
            return_offsets,
        })
    }
}

/// Memory range and cpu count handed to probes that carve a per-cpu
/// allocation out of the target's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHint {
    pub start_addr: u64,
    pub end_addr: u64,
    pub ncpus: u32,
}

/// Everything the analyzer learned about the target process.
#[derive(Debug, Clone)]
pub struct TargetDetails {
    pub pid: i32,
    pub exe_path: PathBuf,
    pub go_version: Version,
    pub libraries: HashMap<String, Version>,
    pub functions: Vec<FunctionInfo>,
    pub allocation: Option<AllocationHint>,
}

impl TargetDetails {
    pub fn function(&self, symbol: &str) -> Option<&FunctionInfo> {
        self.functions.iter().find(|f| f.symbol == symbol)
    }

    /// Version of a linked library, or for standard-library packages the
    /// toolchain version itself.
    pub fn library_version(&self, import_path: &str) -> Option<&Version> {
        self.libraries
            .get(import_path)
            .or_else(|| is_stdlib(import_path).then_some(&self.go_version))
    }
}

fn is_stdlib(import_path: &str) -> bool {
    !import_path
        .split('/')
        .next()
        .is_some_and(|first| first.contains('.'))
}

/// How the user points gotel at a target process.
#[derive(Debug, Clone)]
pub enum TargetSelector {
    Pid(i32),
    ExeName(String),
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Pid(pid) => write!(f, "pid {pid}"),
            TargetSelector::ExeName(name) => write!(f, "executable \"{name}\""),
        }
    }
}

/// An opaque, relocatable probe bytecode unit read from the bytecode
/// directory. The declared constants are rewritten before the kernel sees
/// the program.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub name: String,
    pub bytecode: Vec<u8>,
}

/// A completed request observed in the target, ready for export.
#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_span_id: Option<[u8; 8]>,
    pub name: String,
    pub kind: SpanKind,
    /// Nanoseconds since boot, as reported by the kernel probe.
    pub start_ns: u64,
    pub end_ns: u64,
    pub attributes: Vec<KeyValue>,
    pub library: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_function_info_valid() {
        let f = FunctionInfo::new("net/http.foo".into(), 0x100, vec![0x110, 0x140]).unwrap();
        assert_eq!(f.return_offsets.len(), 2);
    }

    #[test]
    fn test_function_info_rejects_return_before_entry() {
        assert!(FunctionInfo::new("f".into(), 0x100, vec![0x90]).is_err());
    }

    #[test]
    fn test_function_info_rejects_unsorted_returns() {
        assert!(FunctionInfo::new("f".into(), 0x100, vec![0x140, 0x110]).is_err());
    }

    #[test]
    fn test_stdlib_version_falls_back_to_toolchain() {
        let details = TargetDetails {
            pid: 1,
            exe_path: "/proc/1/exe".into(),
            go_version: Version::new(1, 21, 3),
            libraries: HashMap::from([(
                "google.golang.org/grpc".to_string(),
                Version::new(1, 60, 0),
            )]),
            functions: vec![],
            allocation: None,
        };
        assert_eq!(
            details.library_version("net/http"),
            Some(&Version::new(1, 21, 3))
        );
        assert_eq!(
            details.library_version("google.golang.org/grpc"),
            Some(&Version::new(1, 60, 0))
        );
        assert_eq!(details.library_version("github.com/gin-gonic/gin"), None);
    }
}
