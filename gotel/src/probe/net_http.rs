// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Probes for the standard library HTTP stack: the server handler entry
//! point and the client transport round trip.

use opentelemetry::{KeyValue, trace::SpanKind};
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, SERVER_ADDRESS, URL_PATH,
};

use crate::{
    errors::GotelError,
    types::{CallingConvention, Span},
};

use super::{FieldSpec, FunctionSpec, Probe, RecordPrefix, fixed_string};

const METHOD_MAX: usize = 8;
const PATH_MAX: usize = 128;
const HOST_MAX: usize = 64;

pub struct HttpServerProbe;

const SERVER_FUNCTIONS: &[FunctionSpec] = &[FunctionSpec {
    symbol: "net/http.serverHandler.ServeHTTP",
    entry_program: "uprobe_serve_http",
    return_program: Some("uprobe_serve_http_ret"),
}];

const SERVER_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        strct: "net/http.Request",
        library: "net/http",
        field: "Method",
        constant: "method_ptr_pos",
        required: true,
    },
    FieldSpec {
        strct: "net/http.Request",
        library: "net/http",
        field: "URL",
        constant: "url_ptr_pos",
        required: true,
    },
    FieldSpec {
        strct: "net/url.URL",
        library: "net/url",
        field: "Path",
        constant: "path_ptr_pos",
        required: true,
    },
];

// prefix + method + path + status + pad
const SERVER_RECORD_LEN: usize = super::RECORD_PREFIX_LEN + METHOD_MAX + PATH_MAX + 8;

impl Probe for HttpServerProbe {
    fn library_name(&self) -> &'static str {
        "net/http"
    }

    fn object_file(&self, _convention: CallingConvention) -> String {
        "net_http_server.o".to_string()
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
        let path = fixed_string(&rest[METHOD_MAX..METHOD_MAX + PATH_MAX]);
        let status = u32::from_le_bytes(
            rest[METHOD_MAX + PATH_MAX..METHOD_MAX + PATH_MAX + 4]
                .try_into()
                .unwrap_or_default(),
        );

        Ok(Span {
            trace_id: prefix.trace_id,
            span_id: prefix.span_id,
            parent_span_id: prefix.parent_span_id,
            name: format!("{method} {path}"),
            kind: SpanKind::Server,
            start_ns: prefix.start_ns,
            end_ns: prefix.end_ns,
            attributes: vec![
                KeyValue::new(HTTP_REQUEST_METHOD, method),
                KeyValue::new(URL_PATH, path),
                KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(status)),
            ],
            library: self.library_name().to_string(),
        })
    }
}

pub struct HttpClientProbe;

const CLIENT_FUNCTIONS: &[FunctionSpec] = &[FunctionSpec {
    symbol: "net/http.(*Transport).roundTrip",
    entry_program: "uprobe_round_trip",
    return_program: Some("uprobe_round_trip_ret"),
}];

const CLIENT_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        strct: "net/http.Request",
        library: "net/http",
        field: "Method",
        constant: "method_ptr_pos",
        required: true,
    },
    FieldSpec {
        strct: "net/http.Request",
        library: "net/http",
        field: "URL",
        constant: "url_ptr_pos",
        required: true,
    },
    FieldSpec {
        strct: "net/url.URL",
        library: "net/url",
        field: "Path",
        constant: "path_ptr_pos",
        required: true,
    },
    FieldSpec {
        strct: "net/http.Response",
        library: "net/http",
        field: "StatusCode",
        constant: "status_code_pos",
        required: true,
    },
];

// prefix + method + path + host + status + pad
const CLIENT_RECORD_LEN: usize =
    super::RECORD_PREFIX_LEN + METHOD_MAX + PATH_MAX + HOST_MAX + 8;

impl Probe for HttpClientProbe {
    fn library_name(&self) -> &'static str {
        "net/http/client"
    }

    fn object_file(&self, _convention: CallingConvention) -> String {
        "net_http_client.o".to_string()
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
        let path = fixed_string(&rest[METHOD_MAX..METHOD_MAX + PATH_MAX]);
        let host_start = METHOD_MAX + PATH_MAX;
        let host = fixed_string(&rest[host_start..host_start + HOST_MAX]);
        let status = u32::from_le_bytes(
            rest[host_start + HOST_MAX..host_start + HOST_MAX + 4]
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
                KeyValue::new(HTTP_REQUEST_METHOD, method),
                KeyValue::new(URL_PATH, path),
                KeyValue::new(SERVER_ADDRESS, host),
                KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(status)),
            ],
            library: self.library_name().to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn server_record(method: &str, path: &str, status: u32) -> Vec<u8> {
        let mut record = vec![0u8; SERVER_RECORD_LEN];
        record[..16].copy_from_slice(&[1u8; 16]);
        record[16..24].copy_from_slice(&[2u8; 8]);
        record[32..40].copy_from_slice(&1000u64.to_le_bytes());
        record[40..48].copy_from_slice(&2000u64.to_le_bytes());
        let rest = &mut record[super::super::RECORD_PREFIX_LEN..];
        rest[..method.len()].copy_from_slice(method.as_bytes());
        rest[METHOD_MAX..METHOD_MAX + path.len()].copy_from_slice(path.as_bytes());
        rest[METHOD_MAX + PATH_MAX..METHOD_MAX + PATH_MAX + 4]
            .copy_from_slice(&status.to_le_bytes());
        record
    }

    #[test]
    fn test_server_decode() {
        let span = HttpServerProbe
            .decode(&server_record("GET", "/api/users", 200))
            .unwrap();
        assert_eq!(span.name, "GET /api/users");
        assert_eq!(span.kind, SpanKind::Server);
        assert_eq!(span.start_ns, 1000);
        assert_eq!(span.end_ns, 2000);
        assert_eq!(span.parent_span_id, None);
    }

    #[test]
    fn test_server_decode_with_parent() {
        let mut record = server_record("POST", "/orders", 201);
        record[24..32].copy_from_slice(&[3u8; 8]);
        let span = HttpServerProbe.decode(&record).unwrap();
        assert_eq!(span.parent_span_id, Some([3u8; 8]));
    }

    #[test]
    fn test_server_decode_wrong_size() {
        assert!(HttpServerProbe.decode(&vec![0u8; 100]).is_err());
    }

    #[test]
    fn test_record_sizes_differ() {
        assert_ne!(SERVER_RECORD_LEN, CLIENT_RECORD_LEN);
    }
}
