// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! The event pipeline: single consumer of the shared perf ring. Entry and
//! return are already paired inside the kernel (the probe inserts on entry
//! keyed by goroutine id, emits one record on return, then deletes), so
//! every record here is a completed request. Records are demuxed to the
//! owning probe's decoder by their fixed size.

use std::{collections::HashMap, sync::Arc};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::GotelError,
    host::{RingReader, SpanSink},
    probe::Probe,
};

pub struct EventPipeline {
    reader: Box<dyn RingReader>,
    decoders: HashMap<usize, Arc<dyn Probe>>,
    sink: Arc<dyn SpanSink>,
}

impl EventPipeline {
    /// Builds the pipeline over the enabled probes. Two probes declaring
    /// the same record size cannot be demuxed and are refused.
    pub fn new(
        reader: Box<dyn RingReader>,
        probes: &[Arc<dyn Probe>],
        sink: Arc<dyn SpanSink>,
    ) -> Result<Self, GotelError> {
        let mut decoders: HashMap<usize, Arc<dyn Probe>> = HashMap::new();
        for probe in probes {
            let Some(len) = probe.record_len() else {
                continue;
            };
            if let Some(existing) = decoders.get(&len) {
                return Err(GotelError::AmbiguousRecordLayout {
                    a: existing.library_name().to_string(),
                    b: probe.library_name().to_string(),
                    len,
                });
            }
            decoders.insert(len, Arc::clone(probe));
        }
        Ok(EventPipeline {
            reader,
            decoders,
            sink,
        })
    }

    /// Runs until the ring closes. Cancellation closes the ring, the
    /// remaining buffered batches are drained, then the loop exits
    /// cleanly. Read and decode failures are logged and skipped.
    pub async fn run(mut self, token: CancellationToken) {
        let mut draining = false;
        loop {
            let batch = if draining {
                self.reader.next().await
            } else {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("event pipeline cancelled, closing ring");
                        self.reader.close();
                        draining = true;
                        continue;
                    }
                    batch = self.reader.next() => batch,
                }
            };
            match batch {
                Ok(batch) => {
                    if batch.lost > 0 {
                        warn!("perf ring dropped {} samples", batch.lost);
                    }
                    for record in &batch.records {
                        self.handle_record(record);
                    }
                }
                Err(GotelError::RingClosed) => {
                    debug!("event ring closed, pipeline exiting");
                    return;
                }
                Err(e) => {
                    warn!("ring read failed: {e}");
                }
            }
        }
    }

    fn handle_record(&self, record: &[u8]) {
        let Some(probe) = self.decoders.get(&record.len()) else {
            warn!("dropping record of unknown size {}", record.len());
            return;
        };
        match probe.decode(record) {
            Ok(span) => {
                debug!(
                    "span {} from {} trace {}",
                    span.name,
                    span.library,
                    hex::encode(span.trace_id)
                );
                if let Err(e) = self.sink.emit(span) {
                    warn!("span export failed: {e}");
                }
            }
            Err(e) => {
                warn!("failed to decode {} record: {e}", probe.library_name());
            }
        }
    }
}
