//! Streaming scan/forward coordination.
//!
//! Content chunks flow to the client with no added buffering latency while
//! their text accumulates in memory. The terminal `[DONE]` sentinel is held
//! back until the response-side scanners have run over the accumulated text:
//! a clean scan releases the sentinel, a blocking scan replaces it with a
//! single `response_blocked` error event. Chunks already delivered stay
//! delivered; that trade-off is visible in the audit record.
//!
//! Backpressure is the transport's own: the generator reads the next
//! upstream chunk only when the client body polls for another frame, and
//! dropping the body (client disconnect) cancels the upstream stream.

use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use super::audit::{AuditHandle, Outcome};
use super::injection::InjectionScorer;
use super::metrics::{GatewayMetrics, RequestGuard};
use super::pii::PiiScanner;
use super::providers::ChunkStream;
use super::response::scan_response;
use crate::config::PiiAction;
use crate::error::error_body;

/// Everything the coordinator needs besides the stream itself.
pub struct StreamContext {
    pub scorer: Arc<InjectionScorer>,
    pub scanner: Arc<PiiScanner>,
    pub mode: PiiAction,
    pub request_id: String,
    pub provider: String,
    pub metrics: GatewayMetrics,
}

fn sse_frame(payload: &str) -> String {
    format!("data: {payload}\n\n")
}

/// Tee the upstream chunk stream to the client while accumulating text for
/// the deferred response scan.
///
/// The audit handle travels inside the generator: a client disconnect drops
/// the generator, which drops the handle, which emits the record with
/// outcome `client_cancelled` and cancels the upstream read.
pub fn scan_stream(
    mut upstream: ChunkStream,
    ctx: StreamContext,
    mut audit: AuditHandle,
    guard: RequestGuard,
) -> impl Stream<Item = Result<String, std::io::Error>> {
    async_stream::stream! {
        let _guard = guard;
        let mut accumulated = String::new();

        loop {
            match upstream.next().await {
                Some(Ok(chunk)) if chunk.is_done => {
                    // Hold the sentinel: scan first, then decide what the
                    // client's final event is.
                    let scan = scan_response(
                        &ctx.scorer,
                        &ctx.scanner,
                        ctx.mode,
                        &accumulated,
                    );
                    let blocked = scan.blocked;
                    audit.record_mut().response_scan = Some(scan);

                    if blocked {
                        warn!(request_id = %ctx.request_id, "streamed response blocked after scan");
                        let event = error_body(
                            "response_blocked",
                            "response blocked by security policy",
                            &ctx.request_id,
                        );
                        yield Ok(sse_frame(&event.to_string()));
                    } else {
                        yield Ok(sse_frame("[DONE]"));
                    }

                    ctx.metrics
                        .requests_total
                        .with_label_values(&[&ctx.provider, "allowed"])
                        .inc();
                    audit.finish(Outcome::Allowed);
                    return;
                }
                Some(Ok(chunk)) => {
                    accumulated.push_str(&chunk.text_delta);
                    yield Ok(sse_frame(&chunk.data));
                }
                Some(Err(e)) => {
                    warn!(request_id = %ctx.request_id, error = %e, "upstream stream failed");
                    let event = error_body(e.kind(), &e.public_message(), &ctx.request_id);
                    yield Ok(sse_frame(&event.to_string()));

                    ctx.metrics
                        .requests_total
                        .with_label_values(&[&ctx.provider, "upstream_error"])
                        .inc();
                    audit.finish(Outcome::UpstreamError);
                    return;
                }
                None => {
                    // Upstream closed without a sentinel; scan what arrived
                    // and terminate the frame stream cleanly.
                    debug!(request_id = %ctx.request_id, "upstream ended without terminal sentinel");
                    let scan = scan_response(
                        &ctx.scorer,
                        &ctx.scanner,
                        ctx.mode,
                        &accumulated,
                    );
                    let blocked = scan.blocked;
                    audit.record_mut().response_scan = Some(scan);

                    if blocked {
                        let event = error_body(
                            "response_blocked",
                            "response blocked by security policy",
                            &ctx.request_id,
                        );
                        yield Ok(sse_frame(&event.to_string()));
                    } else {
                        yield Ok(sse_frame("[DONE]"));
                    }

                    ctx.metrics
                        .requests_total
                        .with_label_values(&[&ctx.provider, "allowed"])
                        .inc();
                    audit.finish(Outcome::Allowed);
                    return;
                }
            }
        }
    }
}
