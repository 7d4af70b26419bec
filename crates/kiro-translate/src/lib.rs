//! Protocol translation between the public Anthropic/OpenAI surfaces and the
//! upstream envelope, in both directions.
//!
//! Inbound: either API shape normalizes into one [`message::LogicalMessage`]
//! sequence, then into the canonical envelope. Outbound: the semantic event
//! stream re-emits as Anthropic SSE, OpenAI SSE, or aggregated JSON, with
//! truncation detection feeding the recovery cache along the way.

pub mod anthropic;
pub mod ids;
pub mod images;
pub mod message;
pub mod openai;
pub mod request;
pub mod response_anthropic;
pub mod response_openai;
pub mod summarize;
pub mod tokens;
pub mod truncation;

pub use request::{TranslateDeps, TranslatedRequest};
pub use truncation::TruncationCache;
