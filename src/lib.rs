#![forbid(unsafe_code)]

//! llm-relay
//!
//! An LLM API relay with two client-facing facades — Anthropic Messages
//! (`POST /v1/messages`) and OpenAI Chat Completions / Responses
//! (`POST /v1/chat/completions`, `POST /v1/responses`) — routed over pools
//! of credentials against Anthropic, OpenAI-compatible, and Gemini
//! upstreams. Request/response shapes and SSE streams are translated
//! between dialects on the fly, without buffering.
//!
//! Modules on the hot path:
//! - `router`: pool/credential selection with stickiness, weighted and
//!   tiered strategies, and circuit-open avoidance.
//! - `health`: per-credential inflight, EWMA latency, graded open-circuit
//!   windows.
//! - `convert` / `streamconv`: pure dialect transcoding for bodies and
//!   event streams.
//! - `facade`: the orchestrating handlers (pick, call, observe, retry).
//!
//! The admin surface is narrow by design: a live log stream and the
//! credential/provider/pool probes.

pub mod convert;
pub mod crypto;
pub mod env;
pub mod error;
pub mod facade;
pub mod health;
pub mod logbus;
pub mod metrics;
pub mod probes;
pub mod proto;
pub mod relay;
pub mod router;
pub mod server;
pub mod snapshot;
pub mod sse;
pub mod store;
pub mod streamconv;
pub mod upstream;

pub use crate::error::{GatewayError, Result};
pub use crate::proto::{Facade, ProviderKind};
pub use crate::router::{RoutedUpstream, Router};
pub use crate::server::{app, serve, AppState};
