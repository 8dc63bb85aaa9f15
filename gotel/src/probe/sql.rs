// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! database/sql probe. The statement text arrives as a function argument
//! rather than a struct field, so this probe injects no offsets beyond the
//! calling-convention flag.

use opentelemetry::{KeyValue, trace::SpanKind};
use opentelemetry_semantic_conventions::trace::DB_STATEMENT;

use crate::{
    errors::GotelError,
    types::{CallingConvention, Span},
};

use super::{FieldSpec, FunctionSpec, Probe, RecordPrefix, fixed_string};

const QUERY_MAX: usize = 256;

pub struct SqlProbe;

const FUNCTIONS: &[FunctionSpec] = &[FunctionSpec {
    symbol: "database/sql.(*DB).queryDC",
    entry_program: "uprobe_query_dc",
    return_program: Some("uprobe_query_dc_ret"),
}];

const RECORD_LEN: usize = super::RECORD_PREFIX_LEN + QUERY_MAX;

impl Probe for SqlProbe {
    fn library_name(&self) -> &'static str {
        "database/sql"
    }

    fn object_file(&self, _convention: CallingConvention) -> String {
        "database_sql.o".to_string()
    }

    fn functions(&self) -> &'static [FunctionSpec] {
        FUNCTIONS
    }

    fn fields(&self) -> &'static [FieldSpec] {
        &[]
    }

    fn record_len(&self) -> Option<usize> {
        Some(RECORD_LEN)
    }

    fn decode(&self, record: &[u8]) -> Result<Span, GotelError> {
        let (prefix, rest) = RecordPrefix::parse(self.library_name(), record)?;
        if rest.len() != QUERY_MAX {
            return Err(GotelError::RecordTruncated {
                library: self.library_name().to_string(),
                len: record.len(),
            });
        }
        let statement = fixed_string(rest);

        Ok(Span {
            trace_id: prefix.trace_id,
            span_id: prefix.span_id,
            parent_span_id: prefix.parent_span_id,
            name: "DB query".to_string(),
            kind: SpanKind::Client,
            start_ns: prefix.start_ns,
            end_ns: prefix.end_ns,
            attributes: vec![KeyValue::new(DB_STATEMENT, statement)],
            library: self.library_name().to_string(),
        })
    }
}
