//! HTTP client for the Kiro upstream API.
//!
//! One shared `reqwest::Client` per gateway process. The outbound identity
//! headers must match the Kiro IDE client exactly or the upstream rejects
//! the call. The base URL comes from the config snapshot passed per call
//! (fixed in production, overridable under test).

use kiro_core::config::{self, GatewayConfig};
use kiro_core::GatewayError;
use serde::Deserialize;
use tracing::debug;

use crate::envelope::{ConversationEnvelope, ORIGIN_AI_EDITOR};

#[derive(Clone)]
pub struct KiroClient {
    http: reqwest::Client,
}

impl Default for KiroClient {
    fn default() -> Self {
        Self::new()
    }
}

impl KiroClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: String,
        auth_header: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", auth_header)
            .header("Content-Type", "application/json")
            .header("User-Agent", config::USER_AGENT)
            .header("x-amz-user-agent", config::X_AMZ_USER_AGENT)
            .header("x-amzn-codewhisperer-optout", "true")
            .header("x-amzn-kiro-agent-mode", "vibe")
    }

    /// Dispatch one chat request. Status handling belongs to the retry
    /// coordinator; this just gets the response on the wire.
    pub async fn generate_assistant_response(
        &self,
        gateway_config: &GatewayConfig,
        auth_header: &str,
        envelope: &ConversationEnvelope,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/generateAssistantResponse", gateway_config.kiro_api_base_url);
        debug!(
            conversation_id = %envelope.conversation_state.conversation_id,
            model = %envelope.conversation_state.current_message.user_input_message.model_id,
            "dispatching upstream chat request"
        );
        self.request(reqwest::Method::POST, url, auth_header)
            .json(envelope)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("upstream dispatch failed: {e}")))
    }

    pub async fn list_available_models(
        &self,
        gateway_config: &GatewayConfig,
        auth_header: &str,
        profile_arn: Option<&str>,
    ) -> Result<Vec<ModelWire>, GatewayError> {
        let url = format!("{}/ListAvailableModels", gateway_config.kiro_api_base_url);
        let mut req = self
            .request(reqwest::Method::GET, url, auth_header)
            .query(&[("origin", ORIGIN_AI_EDITOR)]);
        if let Some(arn) = profile_arn {
            req = req.query(&[("profileArn", arn)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("ListAvailableModels: {e}")))?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(status_error(status, message));
        }

        let body: ModelListResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("model list decode: {e}")))?;
        Ok(body.models)
    }

    pub async fn list_available_profiles(
        &self,
        gateway_config: &GatewayConfig,
        auth_header: &str,
    ) -> Result<Vec<ProfileWire>, GatewayError> {
        let url = format!("{}/ListAvailableProfiles", gateway_config.kiro_api_base_url);
        let resp = self
            .request(reqwest::Method::GET, url, auth_header)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("ListAvailableProfiles: {e}")))?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(status_error(status, message));
        }

        let body: ProfileListResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("profile list decode: {e}")))?;
        Ok(body.profiles)
    }
}

fn status_error(status: u16, message: String) -> GatewayError {
    if status >= 500 {
        GatewayError::UpstreamTransient(format!("upstream {status}: {message}"))
    } else {
        GatewayError::UpstreamFatal { status, message }
    }
}

#[derive(Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    models: Vec<ModelWire>,
}

/// Model descriptor as the upstream reports it. Fields beyond the id are
/// best-effort; the cache fills in defaults for anything missing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelWire {
    #[serde(alias = "id", alias = "modelName")]
    pub model_id: String,
    #[serde(default)]
    pub max_input_tokens: Option<u32>,
    #[serde(default)]
    pub supports_tools: Option<bool>,
    #[serde(default)]
    pub supports_thinking: Option<bool>,
}

#[derive(Deserialize)]
struct ProfileListResponse {
    #[serde(default)]
    profiles: Vec<ProfileWire>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileWire {
    pub arn: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_wire_tolerates_sparse_payloads() {
        let sparse: ModelWire = serde_json::from_str(r#"{"modelId": "claude-haiku-4.5"}"#).unwrap();
        assert_eq!(sparse.model_id, "claude-haiku-4.5");
        assert!(sparse.max_input_tokens.is_none());

        let rich: ModelWire = serde_json::from_str(
            r#"{"modelId":"claude-sonnet-4.5","maxInputTokens":200000,"supportsTools":true}"#,
        )
        .unwrap();
        assert_eq!(rich.max_input_tokens, Some(200_000));
        assert_eq!(rich.supports_tools, Some(true));
    }

    #[test]
    fn profile_list_decodes() {
        let body: ProfileListResponse = serde_json::from_str(
            r#"{"profiles":[{"arn":"arn:aws:codewhisperer:us-east-1:1:profile/A","name":"dev"}]}"#,
        )
        .unwrap();
        assert_eq!(body.profiles.len(), 1);
        assert_eq!(body.profiles[0].name.as_deref(), Some("dev"));
    }
}
