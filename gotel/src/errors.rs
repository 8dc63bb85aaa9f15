// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

use semver::Version;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GotelError {
    #[error("An error occurred. {0}")]
    Error(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    ProgramError(#[from] aya::programs::ProgramError),
    #[error(transparent)]
    LoadError(#[from] aya::EbpfError),
    #[error(transparent)]
    MapError(#[from] aya::maps::MapError),
    #[error("{path} is not an instrumentable Go binary: {reason}")]
    NotAGoBinary { path: String, reason: String },
    #[error("Go {0} is older than the oldest supported release, cannot determine calling convention")]
    CallingConventionUnknown(Version),
    #[error("symbol {symbol} at {address:#x} is not covered by any executable section")]
    SymbolOutsideExecutableSegments { symbol: String, address: u64 },
    #[error("failed to decode instruction at offset {offset:#x} of {symbol}")]
    DisassemblyFailed { symbol: String, offset: u64 },
    #[error("no offset known for {strct}.{field} at version {version}")]
    OffsetMissing {
        strct: String,
        field: String,
        version: Version,
    },
    #[error("kernel rejected probe {probe}: {reason}")]
    ProbeLoadRejected { probe: String, reason: String },
    #[error("failed to install breakpoint at {addr:#x}")]
    BreakpointInstallFailed {
        addr: u64,
        #[source]
        source: aya::programs::ProgramError,
    },
    #[error("failed to read from the event ring")]
    RingReadFailed(#[source] std::io::Error),
    #[error("event ring closed")]
    RingClosed,
    #[error("record of {len} bytes does not belong to any enabled probe")]
    UnknownRecordLayout { len: usize },
    #[error("record too short for {library} decoder: {len} bytes")]
    RecordTruncated { library: String, len: usize },
    #[error("probes {a} and {b} declare the same record size ({len} bytes)")]
    AmbiguousRecordLayout { a: String, b: String, len: usize },
    #[error("unsupported target architecture {0:?}")]
    UnsupportedArchitecture(object::Architecture),
    #[error("failed to export span: {0}")]
    SpanExportFailed(String),
}
