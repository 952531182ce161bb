use crate::classifier::Classifier;
use crate::emitter::FlowEmitter;
use crate::flow::{ConnectionInfo, FlowRecord, RawExchange, ResponseSlot};
use crate::http::{self, ParsedExchange};
use crate::identity::FlowId;
use crate::ordering::{self, OrderingMode};
use anyhow::Result;
use std::time::Instant;
use tracing::{Span, debug, info, trace, warn};


/// Producer of completed, reassembled streams.
///
/// Implementations resolve a handler for each connection through the
/// classifier and push every finished stream into `on_stream`, in the order
/// the streams complete. An error from `on_stream` aborts the drain.
pub trait StreamSource {
    fn for_each_stream(
        &mut self,
        classifier: &Classifier,
        on_stream: &mut dyn FnMut(RawExchange) -> Result<()>,
    ) -> Result<()>;
}

/// Streams that were already reassembled and tagged elsewhere.
impl StreamSource for Vec<RawExchange> {
    fn for_each_stream(
        &mut self,
        _classifier: &Classifier,
        on_stream: &mut dyn FnMut(RawExchange) -> Result<()>,
    ) -> Result<()> {
        for raw in std::mem::take(self) {
            on_stream(raw)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub streams: usize,
    /// Streams whose protocol tag is not HTTP or HTTPS.
    pub skipped: usize,
    /// Requests that could not be parsed; each ends its stream.
    pub dropped: usize,
    /// Flows emitted with a truncated or absent response.
    pub degraded: usize,
    pub emitted: usize,
}

pub struct Pipeline {
    mode: OrderingMode,
    span: Span,
}

impl Pipeline {
    /// Every event the pipeline logs is recorded inside `span`.
    pub fn new(mode: OrderingMode, span: Span) -> Self {
        Self { mode, span }
    }

    pub fn mode(&self) -> OrderingMode {
        self.mode
    }

    pub fn run<S, E>(
        &self,
        source: &mut S,
        classifier: &Classifier,
        emitter: &mut E,
    ) -> Result<RunSummary>
    where
        S: StreamSource,
        E: FlowEmitter,
    {
        let _entered = self.span.enter();
        let start_time = Instant::now();
        let mut summary = RunSummary::default();
        let mut buffered: Vec<FlowRecord> = Vec::new();

        source.for_each_stream(classifier, &mut |raw| {
            summary.streams += 1;
            let records = convert(raw, &mut summary);
            if self.mode.is_streaming() {
                for record in &records {
                    emitter.append(record)?;
                    summary.emitted += 1;
                }
            } else {
                buffered.extend(records);
            }
            Ok(())
        })?;

        if !self.mode.is_streaming() {
            ordering::sort_by_timestamp(&mut buffered);
            for record in &buffered {
                emitter.append(record)?;
                summary.emitted += 1;
            }
        }
        emitter.finish()?;

        info!(
            mode = ?self.mode,
            streams = summary.streams,
            skipped = summary.skipped,
            dropped = summary.dropped,
            degraded = summary.degraded,
            emitted = summary.emitted,
            elapsed_ms = start_time.elapsed().as_millis(),
            "Completed flow conversion"
        );
        Ok(summary)
    }
}

/// Turns one stream into its flows, counting why exchanges are lost.
fn convert(raw: RawExchange, summary: &mut RunSummary) -> Vec<FlowRecord> {
    if !raw.protocol.is_application() {
        trace!(key = %raw.key, protocol = %raw.protocol, "Skipping non-HTTP stream");
        summary.skipped += 1;
        return Vec::new();
    }

    let parsed = http::parse_stream(&raw);
    if let Some(error) = &parsed.request_error {
        warn!(
            key = %raw.key,
            error = %error,
            parsed = parsed.exchanges.len(),
            "Error parsing HTTP request; dropping exchange"
        );
        summary.dropped += 1;
    } else if parsed.trailing_sent > 0 {
        debug!(
            key = %raw.key,
            bytes = parsed.trailing_sent,
            "Ignoring client bytes after the last exchange"
        );
    }

    parsed
        .exchanges
        .into_iter()
        .map(|exchange| {
            if let ResponseSlot::Truncated { reason, .. } | ResponseSlot::Absent { reason } =
                &exchange.response
            {
                // A readable request still makes a useful flow, so keep it.
                warn!(key = %raw.key, reason = %reason, "Error parsing HTTP response");
                summary.degraded += 1;
            }
            assemble(&raw, exchange)
        })
        .collect()
}

/// Stamps a parsed exchange with its identity and connection metadata.
pub fn assemble(raw: &RawExchange, exchange: ParsedExchange) -> FlowRecord {
    let client = ConnectionInfo {
        endpoint: raw.key.source,
        timestamp_start: exchange.timestamp,
    };
    let server = ConnectionInfo {
        endpoint: raw.key.destination,
        timestamp_start: exchange.timestamp,
    };
    let id = FlowId::derive(
        client.timestamp_start,
        server.timestamp_start,
        &exchange.request.body,
        exchange.response.identity_body(),
    );

    FlowRecord {
        id,
        client,
        server,
        request: exchange.request,
        response: exchange.response,
    }
}
