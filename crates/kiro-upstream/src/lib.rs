//! Kiro upstream integration: the HTTP client, the framed event-stream
//! parser, the model-info cache and the retry coordinator.
//!
//! The upstream speaks a length-prefixed binary frame protocol over one HTTP
//! response body; each frame carries a JSON event. This crate demuxes those
//! frames into an ordered stream of [`event::SemanticEvent`]s that the
//! response translators consume.

pub mod client;
pub mod envelope;
pub mod event;
pub mod frames;
pub mod models;
pub mod parser;
pub mod retry;

pub use client::KiroClient;
pub use envelope::ConversationEnvelope;
pub use event::{SemanticEvent, StopReason};
pub use models::{ModelInfo, ModelInfoCache};
