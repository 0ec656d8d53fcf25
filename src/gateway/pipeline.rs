//! The request security pipeline.
//!
//! An ordered sequence of stages, each producing a typed decision. A deny
//! short-circuits the run; every decision (allowed or not) is appended to
//! the request's audit record. Stages share the common shape "name plus
//! evaluate function" behind the [`Stage`] trait, and a stage may mutate the
//! request in place (PII redaction).

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::audit::{AuditRecord, StageRecord};
use super::injection::InjectionScorer;
use super::pii::PiiScanner;
use super::providers::ChatRequest;
use super::ratelimit::{RateLimiter, RateLimitResult};
use crate::clients::ClientConfig;
use crate::config::{PiiAction, Settings};
use crate::error::GatewayError;

/// What a stage did to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    Pass,
    Redact,
    Block,
    LogOnly,
}

/// One stage's verdict. `error` carries the client-facing rejection when
/// `allow` is false; it never serializes into the audit record.
#[derive(Debug)]
pub struct StageDecision {
    pub allow: bool,
    pub reason: &'static str,
    pub action: StageAction,
    pub detail: Value,
    pub error: Option<GatewayError>,
}

impl StageDecision {
    pub fn pass() -> Self {
        Self {
            allow: true,
            reason: "pass",
            action: StageAction::Pass,
            detail: Value::Null,
            error: None,
        }
    }

    pub fn pass_with(action: StageAction, detail: Value) -> Self {
        Self {
            allow: true,
            reason: "pass",
            action,
            detail,
            error: None,
        }
    }

    pub fn deny(error: GatewayError, detail: Value) -> Self {
        Self {
            allow: false,
            reason: error.kind(),
            action: StageAction::Block,
            detail,
            error: Some(error),
        }
    }
}

/// Mutable view of one request as it moves through the pipeline.
pub struct RequestContext<'a> {
    pub client: &'a ClientConfig,
    pub request: &'a mut ChatRequest,
    /// Filled in by the rate-limit stage; the handler reads it for the
    /// advisory headers on every response.
    pub rate: Option<RateLimitResult>,
}

pub trait Stage: Send + Sync {
    /// Short stable name, used in audit records.
    fn name(&self) -> &'static str;

    fn evaluate(&self, ctx: &mut RequestContext) -> StageDecision;
}

/// Ordered pipeline of stages. Denies short-circuit; stage metadata lands in
/// the audit record either way.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Run every stage in order. Returns the first deny as an error.
    pub fn run(
        &self,
        ctx: &mut RequestContext,
        record: &mut AuditRecord,
    ) -> Result<(), GatewayError> {
        for stage in &self.stages {
            let mut decision = stage.evaluate(ctx);
            record
                .stages
                .push(StageRecord::from_decision(stage.name(), &decision));
            if !decision.allow {
                warn!(
                    stage = stage.name(),
                    reason = decision.reason,
                    client = %ctx.client.client_id,
                    "request blocked"
                );
                let error = decision.error.take().unwrap_or_else(|| {
                    GatewayError::Internal(anyhow::anyhow!("stage denied without an error"))
                });
                return Err(error);
            }
        }
        Ok(())
    }
}

/// Assemble the standard stage order from settings and shared components.
pub fn build_pipeline(
    settings: &Settings,
    limiter: Arc<RateLimiter>,
    scorer: Arc<InjectionScorer>,
    scanner: Arc<PiiScanner>,
) -> Pipeline {
    info!(
        injection_threshold = settings.injection_threshold,
        pii_action = ?settings.pii_action,
        streaming_disabled = settings.disable_streaming,
        "security pipeline configured"
    );

    Pipeline {
        stages: vec![
            Box::new(RateLimitStage { limiter }),
            Box::new(ModelAllowlistStage),
            Box::new(InjectionStage {
                scorer,
                threshold: settings.injection_threshold,
            }),
            Box::new(PiiStage {
                scanner,
                action: settings.pii_action,
            }),
            Box::new(StreamingGateStage {
                disabled: settings.disable_streaming,
            }),
        ],
    }
}

// ============================================================================
// Stages
// ============================================================================

struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> StageDecision {
        let result = self
            .limiter
            .check(&ctx.client.client_id, ctx.client.rate_limit_rpm);
        ctx.rate = Some(result);

        if result.allowed {
            StageDecision::pass_with(
                StageAction::Pass,
                json!({"limit": result.limit, "remaining": result.remaining}),
            )
        } else {
            StageDecision::deny(
                GatewayError::RateLimited {
                    limit: result.limit,
                    reset_seconds: result.reset_seconds,
                },
                json!({"limit": result.limit, "reset_seconds": result.reset_seconds}),
            )
        }
    }
}

struct ModelAllowlistStage;

impl Stage for ModelAllowlistStage {
    fn name(&self) -> &'static str {
        "model_allowlist"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> StageDecision {
        if ctx.client.allows_model(&ctx.request.model) {
            StageDecision::pass()
        } else {
            StageDecision::deny(
                GatewayError::ModelNotAllowed {
                    model: ctx.request.model.clone(),
                },
                json!({
                    "model": ctx.request.model,
                    "allowed_models": ctx.client.allowed_models,
                }),
            )
        }
    }
}

struct InjectionStage {
    scorer: Arc<InjectionScorer>,
    threshold: f64,
}

impl Stage for InjectionStage {
    fn name(&self) -> &'static str {
        "injection"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> StageDecision {
        let scan = self.scorer.scan(&ctx.request.user_text());
        let detail = json!({
            "score": scan.score,
            "patterns": scan.patterns,
            "categories": scan.categories,
        });

        if scan.exceeds(self.threshold) {
            StageDecision::deny(GatewayError::InjectionBlocked { score: scan.score }, detail)
        } else {
            StageDecision::pass_with(StageAction::Pass, detail)
        }
    }
}

struct PiiStage {
    scanner: Arc<PiiScanner>,
    action: PiiAction,
}

impl Stage for PiiStage {
    fn name(&self) -> &'static str {
        "pii"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> StageDecision {
        let scan = self.scanner.scan(&ctx.request.user_text());
        if scan.clean() {
            return StageDecision::pass();
        }

        let detail = json!({
            "types": scan.detections,
            "count": scan.count,
            "action": match self.action {
                PiiAction::Redact => "redact",
                PiiAction::Block => "block",
                PiiAction::LogOnly => "log_only",
            },
        });

        match self.action {
            PiiAction::Block => StageDecision::deny(GatewayError::PiiBlocked, detail),
            PiiAction::LogOnly => StageDecision::pass_with(StageAction::LogOnly, detail),
            PiiAction::Redact => {
                // Rewrite each untrusted message in place; trusted system and
                // assistant turns are left alone.
                for message in ctx
                    .request
                    .messages
                    .iter_mut()
                    .filter(|m| m.role == "user" || m.role == "tool")
                {
                    if let Some(redacted) = self.scanner.scan(&message.content).redacted {
                        message.content = redacted;
                    }
                }
                StageDecision::pass_with(StageAction::Redact, detail)
            }
        }
    }
}

struct StreamingGateStage {
    disabled: bool,
}

impl Stage for StreamingGateStage {
    fn name(&self) -> &'static str {
        "streaming_gate"
    }

    fn evaluate(&self, ctx: &mut RequestContext) -> StageDecision {
        if self.disabled && ctx.request.is_streaming() {
            StageDecision::deny(
                GatewayError::StreamingUnsupported,
                json!({"stream": true, "platform_streaming": false}),
            )
        } else {
            StageDecision::pass()
        }
    }
}
