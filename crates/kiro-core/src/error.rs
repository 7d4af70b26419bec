use thiserror::Error;

/// Gateway-wide error taxonomy. Variants map 1:1 onto the propagation policy:
/// credential errors are recovered internally, everything else is surfaced to
/// the client in the client's own API dialect.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Refresh token rejected by the identity provider. The credential
    /// manager latches permanently failed; requests answer 503 until the
    /// operator reconfigures.
    #[error("Credential permanently failed: {0}")]
    AuthFatal(String),

    #[error("Credential refresh failed: {0}")]
    AuthTransient(String),

    #[error("Invalid request: {0}")]
    RequestInvalid(String),

    #[error("Input too large: {0}")]
    ContextOverflow(String),

    #[error("Upstream error: {0}")]
    UpstreamTransient(String),

    /// Non-retryable upstream 4xx, body text preserved.
    #[error("Upstream rejected request ({status}): {message}")]
    UpstreamFatal { status: u16, message: String },

    /// No meaningful token arrived before the deadline. Distinct from every
    /// other stream error: nothing reached the client, so a retry is safe.
    #[error("No token received from upstream within {timeout_secs}s")]
    FirstTokenTimeout { timeout_secs: u64 },

    /// Error after the first token. Bytes already reached the client; the
    /// stream terminates with an in-band error event.
    #[error("Stream broken: {0}")]
    StreamBroken(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status this error surfaces as, when it surfaces before streaming.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Config(_) => 500,
            GatewayError::AuthFatal(_) => 503,
            GatewayError::AuthTransient(_) => 502,
            GatewayError::RequestInvalid(_) => 400,
            GatewayError::ContextOverflow(_) => 413,
            GatewayError::UpstreamTransient(_) => 502,
            GatewayError::UpstreamFatal { status, .. } => {
                // Translate to the nearest client-side 4xx; anything else is
                // an upstream fault the client can't act on.
                if (400..500).contains(status) {
                    *status
                } else {
                    502
                }
            }
            GatewayError::FirstTokenTimeout { .. } => 502,
            GatewayError::StreamBroken(_) => 502,
            GatewayError::Serialization(_) => 500,
            GatewayError::Io(_) => 500,
        }
    }

    /// Anthropic-dialect error type string.
    pub fn anthropic_type(&self) -> &'static str {
        match self {
            GatewayError::RequestInvalid(_) => "invalid_request_error",
            GatewayError::ContextOverflow(_) => "request_too_large",
            GatewayError::FirstTokenTimeout { .. } => "timeout_error",
            GatewayError::AuthFatal(_) => "api_error",
            GatewayError::UpstreamFatal { .. } => "invalid_request_error",
            _ => "api_error",
        }
    }

    /// OpenAI-dialect error type string.
    pub fn openai_type(&self) -> &'static str {
        match self {
            GatewayError::RequestInvalid(_)
            | GatewayError::ContextOverflow(_)
            | GatewayError::UpstreamFatal { .. } => "invalid_request_error",
            GatewayError::FirstTokenTimeout { .. } => "timeout_error",
            _ => "api_error",
        }
    }

    /// Whether the retry coordinator may re-dispatch the request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthTransient(_)
                | GatewayError::UpstreamTransient(_)
                | GatewayError::FirstTokenTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
