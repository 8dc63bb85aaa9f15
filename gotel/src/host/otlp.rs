// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! OTLP span sink. Spans arrive with kernel monotonic timestamps and
//! pre-assigned trace/span ids; this adapter anchors the timestamps to
//! wall clock and feeds the opentelemetry batch exporter, which owns
//! batching and retries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opentelemetry::{
    Context, KeyValue, global,
    trace::{
        Span as _, SpanContext, SpanId, TraceContextExt as _, TraceFlags, TraceId, TraceState,
        Tracer as _,
    },
};
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

use crate::{errors::GotelError, types::Span};

use super::SpanSink;

pub struct OtlpSpanSink {
    tracer: sdktrace::Tracer,
    boot_epoch: SystemTime,
}

impl OtlpSpanSink {
    /// Installs a batching OTLP pipeline against `endpoint` and anchors
    /// probe timestamps to this host's boot time.
    pub fn new(endpoint: &str, service_name: &str) -> Result<Self, GotelError> {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint.to_string()),
            )
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new(SERVICE_NAME, service_name.to_string()),
            ])))
            .install_batch(runtime::Tokio)
            .map_err(|e| GotelError::SpanExportFailed(e.to_string()))?;

        let boot_secs = procfs::boot_time_secs()
            .map_err(|e| GotelError::Error(format!("cannot determine boot time: {e}")))?;
        Ok(OtlpSpanSink {
            tracer,
            boot_epoch: UNIX_EPOCH + Duration::from_secs(boot_secs),
        })
    }

    /// Flushes and shuts down the global exporter pipeline.
    pub fn shutdown() {
        global::shutdown_tracer_provider();
    }

    fn at(&self, ns_since_boot: u64) -> SystemTime {
        self.boot_epoch + Duration::from_nanos(ns_since_boot)
    }
}

impl SpanSink for OtlpSpanSink {
    fn emit(&self, span: Span) -> Result<(), GotelError> {
        let trace_id = TraceId::from_bytes(span.trace_id);
        let end = self.at(span.end_ns);
        let builder = self
            .tracer
            .span_builder(span.name)
            .with_trace_id(trace_id)
            .with_span_id(SpanId::from_bytes(span.span_id))
            .with_kind(span.kind)
            .with_start_time(self.at(span.start_ns))
            .with_end_time(end)
            .with_attributes(span.attributes);

        let parent_cx = match span.parent_span_id {
            Some(parent) => Context::new().with_remote_span_context(SpanContext::new(
                trace_id,
                SpanId::from_bytes(parent),
                TraceFlags::SAMPLED,
                true,
                TraceState::default(),
            )),
            None => Context::new(),
        };

        let mut exported = self.tracer.build_with_context(builder, &parent_cx);
        exported.end_with_timestamp(end);
        Ok(())
    }
}
