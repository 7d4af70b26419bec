use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a credential was loaded from; refreshes write back to the same place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Env,
    File,
    Sqlite,
}

/// Which identity provider governs the refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProvider {
    /// Kiro Desktop auth: JSON-body refresh, token never rotates.
    Desktop,
    /// AWS SSO OIDC: form-urlencoded RFC 6749 §6 refresh, token may rotate.
    Oidc,
}

/// A long-lived refresh credential plus whatever short-lived state was cached
/// alongside it. Mutated only by the credential manager.
#[derive(Debug, Clone)]
pub struct RefreshCredential {
    pub source: CredentialSource,
    pub refresh_token: String,
    /// Present iff the provider is OIDC.
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// SSO region for the OIDC token endpoint. Never affects the API host.
    pub sso_region: Option<String>,
    /// Profile ARN, sent upstream for Desktop credentials only.
    pub profile_arn: Option<String>,
    /// Originally granted scopes (SQLite installs record these; they are
    /// persisted back verbatim and never sent on refresh).
    pub scopes: Option<Vec<String>>,
    /// Cached access token from the source, if it was still valid at load.
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RefreshCredential {
    /// Provider detection: a device registration (client id + secret) means
    /// AWS SSO OIDC, otherwise Kiro Desktop.
    pub fn provider(&self) -> AuthProvider {
        if self.client_id.is_some() && self.client_secret.is_some() {
            AuthProvider::Oidc
        } else {
            AuthProvider::Desktop
        }
    }

    /// Profile ARN to attach to upstream envelopes. OIDC (Builder ID) users
    /// must not send one; the upstream answers 403 when they do.
    pub fn effective_profile_arn(&self, default_arn: Option<&str>) -> Option<String> {
        match self.provider() {
            AuthProvider::Oidc => None,
            AuthProvider::Desktop => self
                .profile_arn
                .clone()
                .or_else(|| default_arn.map(str::to_string)),
        }
    }
}

/// Clone so a single in-flight refresh outcome can be fanned out to every
/// caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("network error during token refresh: {0}")]
    Network(String),

    /// The refresh token itself was rejected. Unrecoverable without operator
    /// action; the manager latches permanently failed.
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("identity provider error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("credential store error: {0}")]
    Store(String),

    #[error("credential permanently failed; reconfigure and restart")]
    PermanentlyFailed,
}

impl AuthError {
    pub fn retryable(&self) -> bool {
        matches!(self, AuthError::Network(_) | AuthError::Server { .. })
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Network(e.to_string())
    }
}

impl From<AuthError> for kiro_core::GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidGrant(msg) => kiro_core::GatewayError::AuthFatal(msg),
            AuthError::PermanentlyFailed => {
                kiro_core::GatewayError::AuthFatal(e.to_string())
            }
            other => kiro_core::GatewayError::AuthTransient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop_credential() -> RefreshCredential {
        RefreshCredential {
            source: CredentialSource::Env,
            refresh_token: "rt".into(),
            client_id: None,
            client_secret: None,
            sso_region: None,
            profile_arn: None,
            scopes: None,
            access_token: None,
            expires_at: None,
        }
    }

    #[test]
    fn provider_detection_requires_both_oidc_fields() {
        let mut cred = desktop_credential();
        assert_eq!(cred.provider(), AuthProvider::Desktop);

        cred.client_id = Some("c".into());
        assert_eq!(cred.provider(), AuthProvider::Desktop);

        cred.client_secret = Some("s".into());
        assert_eq!(cred.provider(), AuthProvider::Oidc);
    }

    #[test]
    fn oidc_never_sends_profile_arn() {
        let mut cred = desktop_credential();
        cred.client_id = Some("c".into());
        cred.client_secret = Some("s".into());
        cred.profile_arn = Some("arn:aws:codewhisperer:us-east-1:1:profile/X".into());
        assert_eq!(cred.effective_profile_arn(Some("arn:default")), None);
    }

    #[test]
    fn desktop_falls_back_to_default_arn() {
        let cred = desktop_credential();
        assert_eq!(
            cred.effective_profile_arn(Some("arn:default")).as_deref(),
            Some("arn:default")
        );
    }
}
