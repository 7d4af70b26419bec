//! Per-provider refresh-token exchange.
//!
//! Two shapes in the wild:
//!   - Kiro Desktop: JSON `{"refreshToken": ...}` to a fixed endpoint,
//!     answers `{accessToken, expiresIn}`, never rotates the refresh token.
//!   - AWS SSO OIDC: `application/x-www-form-urlencoded` per RFC 6749 §6 to
//!     `oidc.{sso-region}.amazonaws.com/token`. The `scope` parameter is NOT
//!     sent on refresh; previously granted scopes apply implicitly.

use chrono::{DateTime, Duration, Utc};
use kiro_core::config::{self, GatewayConfig};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::credential::{AuthError, AuthProvider, RefreshCredential};

/// Outcome of one refresh-token exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Some providers rotate the refresh token; the manager persists it.
    pub rotated_refresh_token: Option<String>,
}

/// Stateless adapter over a shared HTTP client. Endpoint URLs come from the
/// config snapshot passed per call, so tests can point at a mock.
#[derive(Clone)]
pub struct RefreshAdapter {
    client: reqwest::Client,
}

impl RefreshAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Exchange the refresh token for an access token via the provider the
    /// credential dictates.
    pub async fn refresh(
        &self,
        credential: &RefreshCredential,
        config: &GatewayConfig,
    ) -> Result<TokenGrant, AuthError> {
        match credential.provider() {
            AuthProvider::Desktop => self.refresh_desktop(credential, config).await,
            AuthProvider::Oidc => self.refresh_oidc(credential, config).await,
        }
    }

    async fn refresh_desktop(
        &self,
        credential: &RefreshCredential,
        config: &GatewayConfig,
    ) -> Result<TokenGrant, AuthError> {
        info!("refreshing access token via Kiro Desktop auth");

        let resp = self
            .client
            .post(&config.kiro_desktop_token_url)
            .header("Content-Type", "application/json")
            .header("User-Agent", config::DESKTOP_REFRESH_USER_AGENT)
            .json(&serde_json::json!({ "refreshToken": credential.refresh_token }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_refresh_failure(status, body));
        }

        let token: DesktopTokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Network(format!("invalid desktop token response: {e}")))?;

        debug!(expires_in = token.expires_in, "desktop token refreshed");
        Ok(TokenGrant {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
            rotated_refresh_token: None,
        })
    }

    async fn refresh_oidc(
        &self,
        credential: &RefreshCredential,
        config: &GatewayConfig,
    ) -> Result<TokenGrant, AuthError> {
        let sso_region = credential.sso_region.as_deref().unwrap_or(config::API_REGION);
        let url = oidc_token_url(config, sso_region);
        let client_id = credential
            .client_id
            .as_deref()
            .ok_or_else(|| AuthError::InvalidGrant("OIDC credential missing clientId".into()))?;
        let client_secret = credential
            .client_secret
            .as_deref()
            .ok_or_else(|| AuthError::InvalidGrant("OIDC credential missing clientSecret".into()))?;

        info!(sso_region, "refreshing access token via AWS SSO OIDC");

        // No `scope` field; RFC 6749 §6 says the originally granted scopes apply.
        let body = format!(
            "grant_type=refresh_token&client_id={}&client_secret={}&refresh_token={}",
            urlencoding::encode(client_id),
            urlencoding::encode(client_secret),
            urlencoding::encode(&credential.refresh_token),
        );

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, body = %body, "OIDC refresh failed");
            return Err(classify_refresh_failure(status, body));
        }

        let token: OidcTokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Network(format!("invalid OIDC token response: {e}")))?;

        debug!(expires_in = token.expires_in, rotated = token.refresh_token.is_some(),
            "OIDC token refreshed");
        Ok(TokenGrant {
            access_token: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
            rotated_refresh_token: token.refresh_token,
        })
    }
}

/// OIDC endpoint for the credential's SSO region. Production uses the fixed
/// AWS host; a configured override (tests) wins.
fn oidc_token_url(config: &GatewayConfig, sso_region: &str) -> String {
    match &config.kiro_oidc_token_url {
        Some(url) => url.clone(),
        None => GatewayConfig::oidc_token_url(sso_region),
    }
}

/// 4xx from a token endpoint means the grant itself is dead; 5xx is the
/// provider's problem and worth retrying.
fn classify_refresh_failure(status: u16, body: String) -> AuthError {
    if (400..500).contains(&status) {
        let detail = serde_json::from_str::<OidcErrorBody>(&body)
            .ok()
            .map(|e| match e.error_description {
                Some(desc) => format!("{} ({})", e.error, desc),
                None => e.error,
            })
            .unwrap_or(body);
        AuthError::InvalidGrant(format!("refresh rejected with {status}: {detail}"))
    } else {
        AuthError::Server { status, message: body }
    }
}

#[derive(Deserialize)]
struct DesktopTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

/// AWS SSO OIDC answers camelCase; standard OAuth servers answer snake_case.
/// Accept both.
#[derive(Deserialize)]
struct OidcTokenResponse {
    #[serde(rename = "accessToken", alias = "access_token")]
    access_token: String,
    #[serde(rename = "expiresIn", alias = "expires_in", default = "default_expires_in")]
    expires_in: i64,
    #[serde(rename = "refreshToken", alias = "refresh_token", default)]
    refresh_token: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Deserialize)]
struct OidcErrorBody {
    error: String,
    error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oidc_response_accepts_both_casings() {
        let aws: OidcTokenResponse =
            serde_json::from_str(r#"{"accessToken":"at","expiresIn":1800}"#).unwrap();
        assert_eq!(aws.access_token, "at");
        assert_eq!(aws.expires_in, 1800);
        assert!(aws.refresh_token.is_none());

        let rfc: OidcTokenResponse = serde_json::from_str(
            r#"{"access_token":"at2","expires_in":900,"refresh_token":"rt2"}"#,
        )
        .unwrap();
        assert_eq!(rfc.access_token, "at2");
        assert_eq!(rfc.refresh_token.as_deref(), Some("rt2"));
    }

    #[test]
    fn token_endpoint_4xx_is_invalid_grant() {
        let err = classify_refresh_failure(
            400,
            r#"{"error":"invalid_grant","error_description":"token expired"}"#.into(),
        );
        assert!(matches!(err, AuthError::InvalidGrant(ref m) if m.contains("invalid_grant")));
        assert!(!err.retryable());
    }

    #[test]
    fn token_endpoint_5xx_is_retryable() {
        let err = classify_refresh_failure(503, "try later".into());
        assert!(matches!(err, AuthError::Server { status: 503, .. }));
        assert!(err.retryable());
    }
}
