use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

// Upstream constants. The CodeWhisperer API lives in us-east-1 only.
// The SSO region (when present) affects the OIDC token endpoint, never the API host.
pub const API_REGION: &str = "us-east-1";
pub const KIRO_API_HOST: &str = "https://q.us-east-1.amazonaws.com";
pub const KIRO_DESKTOP_TOKEN_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";

pub const DEFAULT_PROFILE_ARN: &str =
    "arn:aws:codewhisperer:us-east-1:699475941385:profile/EHGA3GRVQMUK";

// Outbound identity headers; must match the Kiro IDE client byte for byte.
pub const USER_AGENT: &str = "aws-sdk-js/1.0.27 ua/2.1 os/win32#10.0.19044 lang/js md/nodejs#22.21.1 api/codewhispererstreaming#1.0.27 m/E KiroIDE-0.7.45-31c325a0ff0a9c8dec5d13048f4257462d751fe5b8af4cb1088f1fca45856c64";
pub const X_AMZ_USER_AGENT: &str = "aws-sdk-js/1.0.27 KiroIDE-0.7.45-31c325a0ff0a9c8dec5d13048f4257462d751fe5b8af4cb1088f1fca45856c64";
pub const DESKTOP_REFRESH_USER_AGENT: &str =
    "KiroIDE-0.7.45-31c325a0ff0a9c8dec5d13048f4257462d751fe5b8af4cb1088f1fca45856c64";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // hard cap per upstream frame
pub const EVENT_CHANNEL_CAPACITY: usize = 32; // parser → translator backpressure bound
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

/// Exit code for invalid configuration (sysexits EX_USAGE-adjacent).
pub const EXIT_CONFIG_INVALID: i32 = 64;
/// Exit code when no usable credential could be discovered.
pub const EXIT_NO_CREDENTIAL: i32 = 77;

/// How thinking content coming back from the upstream is surfaced to clients.
/// The upstream has no real signature scheme, so "emit_block" carries a
/// placeholder signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningHandling {
    /// Inline the thinking text into the regular text stream.
    #[default]
    IncludeAsText,
    /// Emit a thinking content block (Anthropic responses only).
    EmitBlock,
    /// Drop thinking content entirely.
    Strip,
}

/// Top-level gateway config, assembled from env vars over built-in defaults.
///
/// This is deliberately a plain value object: services receive a snapshot per
/// operation rather than capturing fields at startup, so tests can vary the
/// environment and observe behavior without process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bearer key inbound clients must present. Required.
    pub gateway_key: Option<String>,
    /// Env-sourced refresh token (lowest-priority credential source).
    pub refresh_token: Option<String>,
    /// Path to a JSON credentials file.
    pub kiro_creds_file: Option<String>,
    /// Path to a kiro-cli SQLite database.
    pub kiro_cli_db_file: Option<String>,
    /// Default profile ARN (Desktop auth only).
    #[serde(default = "default_profile_arn")]
    pub profile_arn: Option<String>,
    /// Outbound proxy; scheme-normalized at startup.
    pub vpn_proxy_url: Option<String>,
    #[serde(default = "default_first_token_timeout")]
    pub first_token_timeout: u64,
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "bool_true")]
    pub truncation_recovery: bool,
    #[serde(default)]
    pub fake_reasoning_handling: ReasoningHandling,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Upstream API base. Fixed in production; overridable so tests can point
    /// the gateway at a local mock.
    #[serde(default = "default_api_base_url")]
    pub kiro_api_base_url: String,
    /// Desktop refresh endpoint. Same test-override rationale.
    #[serde(default = "default_desktop_token_url")]
    pub kiro_desktop_token_url: String,
    /// When set, all OIDC refreshes go here instead of the per-region AWS
    /// host. Test hook only.
    #[serde(default)]
    pub kiro_oidc_token_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_key: None,
            refresh_token: None,
            kiro_creds_file: None,
            kiro_cli_db_file: None,
            profile_arn: default_profile_arn(),
            vpn_proxy_url: None,
            first_token_timeout: default_first_token_timeout(),
            stream_idle_timeout: default_stream_idle_timeout(),
            max_retries: default_max_retries(),
            truncation_recovery: true,
            fake_reasoning_handling: ReasoningHandling::default(),
            port: default_port(),
            bind: default_bind(),
            kiro_api_base_url: default_api_base_url(),
            kiro_desktop_token_url: default_desktop_token_url(),
            kiro_oidc_token_url: None,
        }
    }
}

fn default_first_token_timeout() -> u64 {
    30
}
fn default_stream_idle_timeout() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}
fn default_profile_arn() -> Option<String> {
    Some(DEFAULT_PROFILE_ARN.to_string())
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_api_base_url() -> String {
    KIRO_API_HOST.to_string()
}
fn default_desktop_token_url() -> String {
    KIRO_DESKTOP_TOKEN_URL.to_string()
}
fn bool_true() -> bool {
    true
}

impl GatewayConfig {
    /// Load config from the process environment over defaults.
    ///
    /// Env names match the field names uppercased (GATEWAY_KEY,
    /// FIRST_TOKEN_TIMEOUT, ...); there is no prefix because the variable set
    /// is inherited from the original deployment surface.
    pub fn load() -> crate::error::Result<Self> {
        let config: GatewayConfig = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Env::raw().only(&[
                "GATEWAY_KEY",
                "REFRESH_TOKEN",
                "KIRO_CREDS_FILE",
                "KIRO_CLI_DB_FILE",
                "PROFILE_ARN",
                "VPN_PROXY_URL",
                "FIRST_TOKEN_TIMEOUT",
                "STREAM_IDLE_TIMEOUT",
                "MAX_RETRIES",
                "TRUNCATION_RECOVERY",
                "FAKE_REASONING_HANDLING",
                "PORT",
                "BIND",
                "KIRO_API_BASE_URL",
                "KIRO_DESKTOP_TOKEN_URL",
                "KIRO_OIDC_TOKEN_URL",
            ]))
            .extract()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Startup validation. Fails fast on a missing gateway key so the process
    /// can exit with `EXIT_CONFIG_INVALID`.
    pub fn validate(&self) -> crate::error::Result<()> {
        match &self.gateway_key {
            Some(key) if !key.is_empty() => Ok(()),
            _ => Err(crate::error::GatewayError::Config(
                "GATEWAY_KEY is required".to_string(),
            )),
        }
    }

    /// OIDC token endpoint for a given SSO region. The API host never moves.
    pub fn oidc_token_url(sso_region: &str) -> String {
        format!("https://oidc.{sso_region}.amazonaws.com/token")
    }
}
