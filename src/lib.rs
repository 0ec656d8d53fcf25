//! # Warden
//!
//! **Security gateway for LLM APIs.**
//!
//! Warden is a reverse proxy that sits between client applications and LLM
//! providers. It speaks the OpenAI `/v1/chat/completions` wire format, runs
//! every request through an ordered security pipeline, forwards accepted
//! requests upstream, scans the response on the way back, and emits one
//! structured audit record per request.
//!
//! ## Architecture
//!
//! - **[`gateway`]** — HTTP surface, pipeline orchestration, scanners,
//!   rate limiting, streaming coordination, audit, metrics
//! - **[`clients`]** — per-client configuration lookup (JSON file, legacy
//!   key list, or remote HTTP table) with constant-time key comparison
//! - **[`config`]** — environment-driven settings
//! - **[`error`]** — unified error types and HTTP mapping using `thiserror`
//! - **[`telemetry`]** — tracing setup with optional OTLP export
//!
//! ## Quick start
//!
//! ```bash
//! # Serve with a static client config
//! CLIENT_CONFIG_PATH=clients.json UPSTREAM_API_KEY=sk-... warden
//!
//! # Route a request through the gateway
//! curl -H "X-API-Key: dev-key-1" -H "Content-Type: application/json" \
//!   -d '{"model":"gpt-4o-mini","messages":[{"role":"user","content":"Hello"}]}' \
//!   http://127.0.0.1:8080/v1/chat/completions
//! ```

pub mod clients;
pub mod config;
pub mod error;
pub mod gateway;
pub mod telemetry;
