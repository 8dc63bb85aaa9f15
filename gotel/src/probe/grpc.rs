// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Probes for google.golang.org/grpc, client and server side. Both read
//! the rpc method from the transport stream; offsets for that struct move
//! with the grpc release linked into the target, not with the toolchain.

use opentelemetry::{KeyValue, trace::SpanKind};
use opentelemetry_semantic_conventions::trace::{RPC_GRPC_STATUS_CODE, RPC_METHOD, RPC_SYSTEM, SERVER_ADDRESS};

use crate::{
    errors::GotelError,
    types::{CallingConvention, Span},
};

use super::{FieldSpec, FunctionSpec, Probe, RecordPrefix, fixed_string};

const METHOD_MAX: usize = 64;
const TARGET_MAX: usize = 64;

const GRPC_LIBRARY: &str = "google.golang.org/grpc";

pub struct GrpcServerProbe;

const SERVER_FUNCTIONS: &[FunctionSpec] = &[FunctionSpec {
    symbol: "google.golang.org/grpc.(*Server).handleStream",
    entry_program: "uprobe_handle_stream",
    return_program: Some("uprobe_handle_stream_ret"),
}];

const SERVER_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        strct: "google.golang.org/grpc/internal/transport.Stream",
        library: GRPC_LIBRARY,
        field: "method",
        constant: "stream_method_pos",
        required: true,
    },
    FieldSpec {
        strct: "google.golang.org/grpc/internal/transport.Stream",
        library: GRPC_LIBRARY,
        field: "id",
        constant: "stream_id_pos",
        required: false,
    },
];

// prefix + method + status + pad
const SERVER_RECORD_LEN: usize = super::RECORD_PREFIX_LEN + METHOD_MAX + 8;

impl Probe for GrpcServerProbe {
    fn library_name(&self) -> &'static str {
        GRPC_LIBRARY
    }

    fn object_file(&self, _convention: CallingConvention) -> String {
        "grpc_server.o".to_string()
    }

    fn functions(&self) -> &'static [FunctionSpec] {
        SERVER_FUNCTIONS
    }

    fn fields(&self) -> &'static [FieldSpec] {
        SERVER_FIELDS
    }

    fn record_len(&self) -> Option<usize> {
        Some(SERVER_RECORD_LEN)
    }

    fn decode(&self, record: &[u8]) -> Result<Span, GotelError> {
        let (prefix, rest) = RecordPrefix::parse(self.library_name(), record)?;
        if rest.len() != SERVER_RECORD_LEN - super::RECORD_PREFIX_LEN {
            return Err(GotelError::RecordTruncated {
                library: self.library_name().to_string(),
                len: record.len(),
            });
        }
        let method = fixed_string(&rest[..METHOD_MAX]);
        let status = i32::from_le_bytes(
            rest[METHOD_MAX..METHOD_MAX + 4].try_into().unwrap_or_default(),
        );

        Ok(Span {
            trace_id: prefix.trace_id,
            span_id: prefix.span_id,
            parent_span_id: prefix.parent_span_id,
            name: method.clone(),
            kind: SpanKind::Server,
            start_ns: prefix.start_ns,
            end_ns: prefix.end_ns,
            attributes: vec![
                KeyValue::new(RPC_SYSTEM, "grpc"),
                KeyValue::new(RPC_METHOD, method),
                KeyValue::new(RPC_GRPC_STATUS_CODE, i64::from(status)),
            ],
            library: self.library_name().to_string(),
        })
    }
}

pub struct GrpcClientProbe;

const CLIENT_FUNCTIONS: &[FunctionSpec] = &[FunctionSpec {
    symbol: "google.golang.org/grpc.(*ClientConn).Invoke",
    entry_program: "uprobe_invoke",
    return_program: Some("uprobe_invoke_ret"),
}];

const CLIENT_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        strct: "google.golang.org/grpc/internal/transport.Stream",
        library: GRPC_LIBRARY,
        field: "method",
        constant: "stream_method_pos",
        required: true,
    },
    FieldSpec {
        strct: "google.golang.org/grpc.ClientConn",
        library: GRPC_LIBRARY,
        field: "target",
        constant: "target_ptr_pos",
        required: true,
    },
];

// prefix + method + target + status + pad
const CLIENT_RECORD_LEN: usize = super::RECORD_PREFIX_LEN + METHOD_MAX + TARGET_MAX + 8;

impl Probe for GrpcClientProbe {
    fn library_name(&self) -> &'static str {
        "google.golang.org/grpc/client"
    }

    fn object_file(&self, _convention: CallingConvention) -> String {
        "grpc_client.o".to_string()
    }

    fn functions(&self) -> &'static [FunctionSpec] {
        CLIENT_FUNCTIONS
    }

    fn fields(&self) -> &'static [FieldSpec] {
        CLIENT_FIELDS
    }

    fn record_len(&self) -> Option<usize> {
        Some(CLIENT_RECORD_LEN)
    }

    fn decode(&self, record: &[u8]) -> Result<Span, GotelError> {
        let (prefix, rest) = RecordPrefix::parse(self.library_name(), record)?;
        if rest.len() != CLIENT_RECORD_LEN - super::RECORD_PREFIX_LEN {
            return Err(GotelError::RecordTruncated {
                library: self.library_name().to_string(),
                len: record.len(),
            });
        }
        let method = fixed_string(&rest[..METHOD_MAX]);
        let target = fixed_string(&rest[METHOD_MAX..METHOD_MAX + TARGET_MAX]);
        let status = i32::from_le_bytes(
            rest[METHOD_MAX + TARGET_MAX..METHOD_MAX + TARGET_MAX + 4]
                .try_into()
                .unwrap_or_default(),
        );

        Ok(Span {
            trace_id: prefix.trace_id,
            span_id: prefix.span_id,
            parent_span_id: prefix.parent_span_id,
            name: method.clone(),
            kind: SpanKind::Client,
            start_ns: prefix.start_ns,
            end_ns: prefix.end_ns,
            attributes: vec![
                KeyValue::new(RPC_SYSTEM, "grpc"),
                KeyValue::new(RPC_METHOD, method),
                KeyValue::new(SERVER_ADDRESS, target),
                KeyValue::new(RPC_GRPC_STATUS_CODE, i64::from(status)),
            ],
            library: self.library_name().to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_client_decode() {
        let mut record = vec![0u8; CLIENT_RECORD_LEN];
        record[..16].copy_from_slice(&[7u8; 16]);
        record[16..24].copy_from_slice(&[8u8; 8]);
        record[32..40].copy_from_slice(&10u64.to_le_bytes());
        record[40..48].copy_from_slice(&20u64.to_le_bytes());
        let rest = &mut record[super::super::RECORD_PREFIX_LEN..];
        rest[..22].copy_from_slice(b"/api.v1.Users/GetUser\0");
        rest[METHOD_MAX..METHOD_MAX + 15].copy_from_slice(b"localhost:9090\0");

        let span = GrpcClientProbe.decode(&record).unwrap();
        assert_eq!(span.name, "/api.v1.Users/GetUser");
        assert_eq!(span.kind, SpanKind::Client);
        assert_eq!(span.library, "google.golang.org/grpc/client");
    }

    #[test]
    fn test_server_optional_field_is_stream_id() {
        let optional: Vec<_> = SERVER_FIELDS.iter().filter(|f| !f.required).collect();
        assert_eq!(optional.len(), 1);
        assert_eq!(optional[0].field, "id");
    }
}
