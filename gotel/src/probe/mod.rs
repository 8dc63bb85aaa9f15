// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Probe registry. Each probe pairs opaque kernel bytecode with the
//! metadata the loader needs: which functions to break on, which
//! struct-field offsets to inject, and how to decode the records it emits.

pub mod goroutines;
pub mod grpc;
pub mod net_http;
pub mod sql;

use std::sync::Arc;

use crate::{
    errors::GotelError,
    types::{CallingConvention, Span},
};

/// One function a probe instruments: a breakpoint on entry and, unless the
/// probe only samples entries, one on every return site.
#[derive(Debug, Clone, Copy)]
pub struct FunctionSpec {
    pub symbol: &'static str,
    pub entry_program: &'static str,
    pub return_program: Option<&'static str>,
}

/// A struct-field offset the probe's bytecode declared as a relocation
/// point. `strct` is the offset-index key, `library` the import path whose
/// version governs the lookup.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub strct: &'static str,
    pub library: &'static str,
    pub field: &'static str,
    pub constant: &'static str,
    pub required: bool,
}

/// Capability set every probe provides to the manager. Probes are plain
/// records behind this trait; they hold no reference back to the manager
/// and all runtime state lives in kernel maps.
pub trait Probe: Send + Sync {
    /// Import path of the instrumented library, e.g. `"net/http"`.
    fn library_name(&self) -> &'static str;

    /// Bytecode object file for the detected calling convention, relative
    /// to the bytecode directory.
    fn object_file(&self, convention: CallingConvention) -> String;

    fn functions(&self) -> &'static [FunctionSpec];

    fn fields(&self) -> &'static [FieldSpec];

    /// Probes that carve a per-cpu scratch region out of the target's
    /// address space receive `total_cpus`/`start_addr`/`end_addr`.
    fn needs_allocation(&self) -> bool {
        false
    }

    /// Mandatory probes abort startup when they cannot load.
    fn mandatory(&self) -> bool {
        false
    }

    /// Exact size of this probe's ring records. `None` for probes that
    /// only maintain maps. Sizes must be unique across enabled probes;
    /// they are the demux key on the shared ring.
    fn record_len(&self) -> Option<usize>;

    fn decode(&self, record: &[u8]) -> Result<Span, GotelError>;
}

/// All built-in probes, correlator first. The manager preserves this order
/// when loading.
pub fn registry() -> Vec<Arc<dyn Probe>> {
    vec![
        Arc::new(goroutines::GoroutinesProbe),
        Arc::new(net_http::HttpServerProbe),
        Arc::new(net_http::HttpClientProbe),
        Arc::new(grpc::GrpcServerProbe),
        Arc::new(grpc::GrpcClientProbe),
        Arc::new(sql::SqlProbe),
    ]
}

/// Size of the prefix every ring record starts with.
pub const RECORD_PREFIX_LEN: usize = 48;

/// The common little-endian record prefix emitted by every probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPrefix {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub parent_span_id: Option<[u8; 8]>,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl RecordPrefix {
    /// Splits `record` into the parsed prefix and the protocol-specific
    /// remainder.
    pub fn parse<'a>(library: &str, record: &'a [u8]) -> Result<(Self, &'a [u8]), GotelError> {
        if record.len() < RECORD_PREFIX_LEN {
            return Err(GotelError::RecordTruncated {
                library: library.to_string(),
                len: record.len(),
            });
        }
        let mut trace_id = [0u8; 16];
        trace_id.copy_from_slice(&record[0..16]);
        let mut span_id = [0u8; 8];
        span_id.copy_from_slice(&record[16..24]);
        let mut parent = [0u8; 8];
        parent.copy_from_slice(&record[24..32]);
        let start_ns = u64::from_le_bytes(record[32..40].try_into().unwrap_or_default());
        let end_ns = u64::from_le_bytes(record[40..48].try_into().unwrap_or_default());
        Ok((
            RecordPrefix {
                trace_id,
                span_id,
                parent_span_id: (parent != [0u8; 8]).then_some(parent),
                start_ns,
                end_ns,
            },
            &record[RECORD_PREFIX_LEN..],
        ))
    }
}

/// Reads a zero-terminated byte array field as text.
pub(crate) fn fixed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
