//! HTTP handlers: the chat-completion orchestrator, health, and metrics.
//!
//! The orchestrator owns the request lifecycle: authenticate, run the
//! pipeline, forward via the selected provider, scan the response, and emit
//! exactly one audit record. Pipeline denials become client-visible errors
//! per the error table; unexpected faults are scrubbed to `internal_error`.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::audit::{new_request_id, AuditHandle, AuditRecord, Outcome, StageRecord};
use super::metrics::RequestGuard;
use super::pii::PiiScanner;
use super::pipeline::RequestContext;
use super::providers::{assistant_text, ChatRequest};
use super::ratelimit::RateLimitResult;
use super::response::scan_response;
use super::stream::{scan_stream, StreamContext};
use super::GatewayState;
use crate::clients::ClientStatus;
use crate::config::PiiAction;
use crate::error::{error_body, GatewayError};

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn metrics(State(state): State<Arc<GatewayState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
        .into_response()
}

pub async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();
    let guard = RequestGuard::new(&state.metrics);

    // Parse and validate the canonical request shape
    let mut request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(request_id = %request_id, error = %e, "malformed request body");
            return reject_unparsed(
                &state,
                &request_id,
                GatewayError::InvalidRequest("malformed JSON body".to_string()),
            );
        }
    };
    if request.messages.is_empty() {
        return reject_unparsed(
            &state,
            &request_id,
            GatewayError::InvalidRequest("messages must not be empty".to_string()),
        );
    }

    let record = AuditRecord::new(&request_id, &request.model, request.is_streaming());
    let mut audit = AuditHandle::new(state.audit.clone(), record);

    // --- Authenticate ---
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    let client = match api_key {
        None => {
            return conclude_denied(&state, audit, "none", GatewayError::Unauthenticated, &request_id, None);
        }
        Some(key) => match state.directory.authenticate(key).await {
            Err(e) => {
                return conclude_denied(
                    &state,
                    audit,
                    "none",
                    GatewayError::StoreUnavailable(e.to_string()),
                    &request_id,
                    None,
                );
            }
            Ok(None) => {
                return conclude_denied(&state, audit, "none", GatewayError::Unauthenticated, &request_id, None);
            }
            Ok(Some(client)) => client,
        },
    };

    let provider_name = client.provider.to_string();
    {
        let record = audit.record_mut();
        record.client_id = Some(client.client_id.clone());
        record.provider = provider_name.clone();
    }

    if client.status == ClientStatus::Suspended {
        audit.record_mut().stages.push(StageRecord {
            name: "auth",
            allow: false,
            reason_code: "client_suspended",
            detail: Value::Null,
        });
        return conclude_denied(
            &state,
            audit,
            &provider_name,
            GatewayError::ClientSuspended,
            &request_id,
            None,
        );
    }
    audit.record_mut().stages.push(StageRecord {
        name: "auth",
        allow: true,
        reason_code: "pass",
        detail: Value::Null,
    });

    // --- Security pipeline ---
    let mut ctx = RequestContext {
        client: &client,
        request: &mut request,
        rate: None,
    };
    let pipeline_result = state.pipeline.run(&mut ctx, audit.record_mut());
    let rate = ctx.rate;
    if let Err(e) = pipeline_result {
        return conclude_denied(&state, audit, &provider_name, e, &request_id, rate);
    }

    // --- Forward ---
    let provider = match state.registry.get(client.provider).await {
        Ok(provider) => provider,
        Err(e) => {
            return conclude_denied(&state, audit, &provider_name, e, &request_id, rate);
        }
    };

    if request.is_streaming() {
        let started = Instant::now();
        let chunks = match provider.stream(&request, &client).await {
            Ok(chunks) => chunks,
            Err(e) => {
                return conclude_upstream_error(&state, audit, &provider_name, e, &request_id, rate);
            }
        };
        let elapsed = started.elapsed();
        audit.record_mut().upstream_latency_ms = Some(elapsed.as_millis() as u64);
        state
            .metrics
            .upstream_latency_seconds
            .with_label_values(&[&provider_name])
            .observe(elapsed.as_secs_f64());

        info!(
            request_id = %request_id,
            client = %client.client_id,
            provider = %provider_name,
            "streaming upstream response"
        );

        let stream_ctx = StreamContext {
            scorer: state.scorer.clone(),
            scanner: state.scanner.clone(),
            mode: state.settings.response_pii_action,
            request_id: request_id.clone(),
            provider: provider_name.clone(),
            metrics: state.metrics.clone(),
        };
        let mut response = Response::new(Body::from_stream(scan_stream(
            chunks, stream_ctx, audit, guard,
        )));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        apply_common_headers(response.headers_mut(), &request_id, rate.as_ref());
        return response;
    }

    // --- Buffered round trip ---
    let started = Instant::now();
    let upstream = provider.complete(&request, &client).await;
    let elapsed = started.elapsed();
    audit.record_mut().upstream_latency_ms = Some(elapsed.as_millis() as u64);
    state
        .metrics
        .upstream_latency_seconds
        .with_label_values(&[&provider_name])
        .observe(elapsed.as_secs_f64());

    let mut upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            return conclude_upstream_error(&state, audit, &provider_name, e, &request_id, rate);
        }
    };

    // --- Response scan ---
    let content = assistant_text(&upstream.body);
    let scan = scan_response(
        &state.scorer,
        &state.scanner,
        state.settings.response_pii_action,
        &content,
    );
    let blocked = scan.blocked;
    if state.settings.response_pii_action == PiiAction::Redact && !scan.pii.clean() {
        redact_choices(&mut upstream.body, &state.scanner);
    }
    audit.record_mut().response_scan = Some(scan);

    if blocked {
        let e = GatewayError::ResponseBlocked;
        state
            .metrics
            .denials_total
            .with_label_values(&[e.kind()])
            .inc();
        state
            .metrics
            .requests_total
            .with_label_values(&[&provider_name, "allowed"])
            .inc();
        // The request was forwarded; the block is a response-side verdict
        audit.finish(Outcome::Allowed);
        return error_response(&e, &request_id, rate.as_ref());
    }

    info!(
        request_id = %request_id,
        client = %client.client_id,
        provider = %provider_name,
        status = upstream.status,
        latency_ms = elapsed.as_millis() as u64,
        "request proxied"
    );

    state
        .metrics
        .requests_total
        .with_label_values(&[&provider_name, "allowed"])
        .inc();
    audit.finish(Outcome::Allowed);

    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(upstream.body)).into_response();
    apply_common_headers(response.headers_mut(), &request_id, rate.as_ref());
    response
}

/// Redact PII in every choice's message content, in place.
fn redact_choices(body: &mut Value, scanner: &PiiScanner) {
    let Some(choices) = body.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for choice in choices {
        let Some(content) = choice
            .get_mut("message")
            .and_then(|m| m.get_mut("content"))
        else {
            continue;
        };
        if let Some(text) = content.as_str() {
            if let Some(redacted) = scanner.scan(text).redacted {
                *content = Value::String(redacted);
            }
        }
    }
}

/// Denial before a parseable request exists: emit a minimal audit record
/// directly and answer with the error body.
fn reject_unparsed(state: &GatewayState, request_id: &str, e: GatewayError) -> Response {
    let mut record = AuditRecord::new(request_id, "unknown", false);
    record.stages.push(StageRecord {
        name: "request",
        allow: false,
        reason_code: e.kind(),
        detail: Value::Null,
    });
    record.outcome = Outcome::Denied;
    state.audit.emit(&record);
    state
        .metrics
        .denials_total
        .with_label_values(&[e.kind()])
        .inc();
    state
        .metrics
        .requests_total
        .with_label_values(&["none", "denied"])
        .inc();
    error_response(&e, request_id, None)
}

fn conclude_denied(
    state: &GatewayState,
    audit: AuditHandle,
    provider: &str,
    e: GatewayError,
    request_id: &str,
    rate: Option<RateLimitResult>,
) -> Response {
    state
        .metrics
        .denials_total
        .with_label_values(&[e.kind()])
        .inc();
    state
        .metrics
        .requests_total
        .with_label_values(&[provider, "denied"])
        .inc();
    audit.finish(Outcome::Denied);
    error_response(&e, request_id, rate.as_ref())
}

fn conclude_upstream_error(
    state: &GatewayState,
    audit: AuditHandle,
    provider: &str,
    e: GatewayError,
    request_id: &str,
    rate: Option<RateLimitResult>,
) -> Response {
    state
        .metrics
        .requests_total
        .with_label_values(&[provider, "upstream_error"])
        .inc();
    audit.finish(Outcome::UpstreamError);
    error_response(&e, request_id, rate.as_ref())
}

/// Build the JSON error response with correlation and advisory headers.
fn error_response(e: &GatewayError, request_id: &str, rate: Option<&RateLimitResult>) -> Response {
    let mut response = (
        e.status(),
        Json(error_body(e.kind(), &e.public_message(), request_id)),
    )
        .into_response();

    apply_common_headers(response.headers_mut(), request_id, rate);
    if let GatewayError::RateLimited { reset_seconds, .. } = e {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(*reset_seconds));
    }
    response
}

fn apply_common_headers(
    headers: &mut HeaderMap,
    request_id: &str,
    rate: Option<&RateLimitResult>,
) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    if let Some(rate) = rate {
        headers.insert("x-ratelimit-limit", HeaderValue::from(rate.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(rate.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(rate.reset_seconds));
    }
}
