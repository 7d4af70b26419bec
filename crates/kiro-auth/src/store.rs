//! Pluggable credential persistence.
//!
//! Three backends, probed at startup in priority order SQLite > JSON file >
//! env. The first source that yields a refresh token wins and receives all
//! write-backs for the life of the process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use kiro_core::config::GatewayConfig;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::credential::{AuthError, CredentialSource, RefreshCredential};

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<RefreshCredential>, AuthError>;
    fn save(&self, credential: &RefreshCredential) -> Result<(), AuthError>;
}

/// Probe the configured sources in priority order and return the winning
/// store together with the credential it produced.
pub fn discover_credential(
    config: &GatewayConfig,
) -> Result<Option<(Box<dyn CredentialStore>, RefreshCredential)>, AuthError> {
    if let Some(db_path) = config.kiro_cli_db_file.as_deref().filter(|p| !p.is_empty()) {
        let store = SqliteStore::new(db_path);
        match store.load() {
            Ok(Some(cred)) => {
                info!(path = db_path, "credentials loaded from SQLite");
                return Ok(Some((Box::new(store), cred)));
            }
            Ok(None) => warn!(path = db_path, "SQLite database yielded no refresh token"),
            Err(e) => warn!(path = db_path, error = %e, "SQLite credential load failed"),
        }
    }

    if let Some(file_path) = config.kiro_creds_file.as_deref().filter(|p| !p.is_empty()) {
        let store = FileStore::new(file_path);
        match store.load() {
            Ok(Some(cred)) => {
                info!(path = file_path, "credentials loaded from JSON file");
                return Ok(Some((Box::new(store), cred)));
            }
            Ok(None) => warn!(path = file_path, "credentials file yielded no refresh token"),
            Err(e) => warn!(path = file_path, error = %e, "file credential load failed"),
        }
    }

    let store = EnvStore::new(config.refresh_token.clone(), config.profile_arn.clone());
    if let Some(cred) = store.load()? {
        info!("credentials loaded from environment");
        return Ok(Some((Box::new(store), cred)));
    }

    Ok(None)
}

// ── Env backend ──────────────────────────────────────────────────────────────

/// Env-sourced credential. Nothing to persist; save warns once and succeeds.
pub struct EnvStore {
    refresh_token: Option<String>,
    profile_arn: Option<String>,
    save_warned: AtomicBool,
}

impl EnvStore {
    pub fn new(refresh_token: Option<String>, profile_arn: Option<String>) -> Self {
        Self {
            refresh_token,
            profile_arn,
            save_warned: AtomicBool::new(false),
        }
    }
}

impl CredentialStore for EnvStore {
    fn load(&self) -> Result<Option<RefreshCredential>, AuthError> {
        let Some(token) = self.refresh_token.clone().filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(RefreshCredential {
            source: CredentialSource::Env,
            refresh_token: token,
            client_id: None,
            client_secret: None,
            sso_region: None,
            profile_arn: self.profile_arn.clone(),
            scopes: None,
            access_token: None,
            expires_at: None,
        }))
    }

    fn save(&self, _credential: &RefreshCredential) -> Result<(), AuthError> {
        if !self.save_warned.swap(true, Ordering::Relaxed) {
            warn!("REFRESH_TOKEN comes from the environment; refreshed tokens are not persisted");
        }
        Ok(())
    }
}

// ── JSON file backend ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CredsFile {
    refresh_token: Option<String>,
    profile_arn: Option<String>,
    region: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl CredentialStore for FileStore {
    fn load(&self) -> Result<Option<RefreshCredential>, AuthError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| AuthError::Store(format!("cannot read {}: {e}", self.path.display())))?;
        let file: CredsFile = serde_json::from_str(&data)
            .map_err(|e| AuthError::Store(format!("invalid credentials JSON: {e}")))?;

        let Some(token) = file.refresh_token.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(RefreshCredential {
            source: CredentialSource::File,
            refresh_token: token,
            client_id: file.client_id,
            client_secret: file.client_secret,
            sso_region: file.region,
            profile_arn: file.profile_arn,
            scopes: None,
            access_token: None,
            expires_at: None,
        }))
    }

    /// Atomic write: temp file in the same directory, then rename over the
    /// target. Credentials files are mode 0600.
    fn save(&self, credential: &RefreshCredential) -> Result<(), AuthError> {
        let file = CredsFile {
            refresh_token: Some(credential.refresh_token.clone()),
            profile_arn: credential.profile_arn.clone(),
            region: credential.sso_region.clone(),
            client_id: credential.client_id.clone(),
            client_secret: credential.client_secret.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| AuthError::Store(e.to_string()))?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| AuthError::Store(format!("cannot create temp file: {e}")))?;

        use std::io::Write;
        tmp.write_all(json.as_bytes())
            .map_err(|e| AuthError::Store(format!("cannot write temp file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(tmp.path(), perms)
                .map_err(|e| AuthError::Store(format!("cannot set permissions: {e}")))?;
        }

        tmp.persist(&self.path)
            .map_err(|e| AuthError::Store(format!("cannot persist credentials: {e}")))?;
        Ok(())
    }
}

// ── SQLite backend (kiro-cli database) ───────────────────────────────────────

/// Scope prefixes probed in order. `kirocli:` is current; `codewhisperer:`
/// covers legacy installs.
const KV_SCOPES: [&str; 2] = ["kirocli", "codewhisperer"];

#[derive(Serialize, Deserialize, Default)]
struct TokenRow {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    scopes: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Default)]
struct RegistrationRow {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

pub struct SqliteStore {
    path: PathBuf,
    /// Scope the credential was found under; save writes back under it.
    scope: std::sync::Mutex<&'static str>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            scope: std::sync::Mutex::new(KV_SCOPES[0]),
        }
    }

    fn open(&self) -> Result<Connection, AuthError> {
        Connection::open(&self.path)
            .map_err(|e| AuthError::Store(format!("cannot open {}: {e}", self.path.display())))
    }

    fn read_kv(conn: &Connection, key: &str) -> Result<Option<String>, AuthError> {
        conn.query_row("SELECT value FROM auth_kv WHERE key = ?1", [key], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .map_err(|e| AuthError::Store(format!("auth_kv read failed: {e}")))
    }
}

impl CredentialStore for SqliteStore {
    fn load(&self) -> Result<Option<RefreshCredential>, AuthError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let conn = self.open()?;

        for scope in KV_SCOPES {
            let Some(token_json) = Self::read_kv(&conn, &format!("{scope}:odic:token"))? else {
                continue;
            };
            let token: TokenRow = serde_json::from_str(&token_json)
                .map_err(|e| AuthError::Store(format!("invalid token row: {e}")))?;
            let Some(refresh_token) = token.refresh_token.filter(|t| !t.is_empty()) else {
                continue;
            };

            let registration: RegistrationRow = Self::read_kv(
                &conn,
                &format!("{scope}:odic:device-registration"),
            )?
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();

            // Carry a still-valid cached access token forward so the first
            // request can skip a refresh.
            let expires_at = token
                .expires_at
                .as_deref()
                .and_then(parse_expiry)
                .filter(|at| *at > Utc::now());
            let access_token = expires_at.and(token.access_token);

            *self.scope.lock().expect("scope lock poisoned") = scope;
            return Ok(Some(RefreshCredential {
                source: CredentialSource::Sqlite,
                refresh_token,
                client_id: registration.client_id,
                client_secret: registration.client_secret,
                sso_region: token.region,
                profile_arn: None,
                scopes: token.scopes,
                access_token,
                expires_at,
            }));
        }
        Ok(None)
    }

    /// Both rows update in one transaction so a crash can't split the token
    /// from its registration.
    fn save(&self, credential: &RefreshCredential) -> Result<(), AuthError> {
        let scope = *self.scope.lock().expect("scope lock poisoned");
        let mut conn = self.open()?;
        let tx = conn
            .transaction()
            .map_err(|e| AuthError::Store(format!("transaction begin failed: {e}")))?;

        let token = TokenRow {
            access_token: credential.access_token.clone(),
            refresh_token: Some(credential.refresh_token.clone()),
            expires_at: credential
                .expires_at
                .map(|at| at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            region: credential.sso_region.clone(),
            scopes: credential.scopes.clone(),
        };
        let registration = RegistrationRow {
            client_id: credential.client_id.clone(),
            client_secret: credential.client_secret.clone(),
        };

        tx.execute(
            "INSERT INTO auth_kv(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (
                format!("{scope}:odic:token"),
                serde_json::to_string(&token).map_err(|e| AuthError::Store(e.to_string()))?,
            ),
        )
        .map_err(|e| AuthError::Store(format!("token row write failed: {e}")))?;

        tx.execute(
            "INSERT INTO auth_kv(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            (
                format!("{scope}:odic:device-registration"),
                serde_json::to_string(&registration)
                    .map_err(|e| AuthError::Store(e.to_string()))?,
            ),
        )
        .map_err(|e| AuthError::Store(format!("registration row write failed: {e}")))?;

        tx.commit()
            .map_err(|e| AuthError::Store(format!("transaction commit failed: {e}")))
    }
}

/// kiro-cli writes ISO-8601 with a `Z` suffix.
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::AuthProvider;

    fn sqlite_fixture(rows: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch("CREATE TABLE auth_kv (key TEXT PRIMARY KEY, value TEXT);")
            .unwrap();
        for (key, value) in rows {
            conn.execute("INSERT INTO auth_kv(key, value) VALUES (?1, ?2)", (key, value))
                .unwrap();
        }
        file
    }

    #[test]
    fn file_store_round_trip_preserves_oidc_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(
            &path,
            r#"{"refreshToken":"rt","clientId":"c","clientSecret":"s","region":"ap-southeast-1"}"#,
        )
        .unwrap();

        let store = FileStore::new(&path);
        let cred = store.load().unwrap().unwrap();
        assert_eq!(cred.provider(), AuthProvider::Oidc);
        assert_eq!(cred.sso_region.as_deref(), Some("ap-southeast-1"));

        let mut updated = cred.clone();
        updated.refresh_token = "rt2".to_string();
        store.save(&updated).unwrap();

        let reloaded = store.load().unwrap().unwrap();
        assert_eq!(reloaded.refresh_token, "rt2");
        assert_eq!(reloaded.client_id.as_deref(), Some("c"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn sqlite_store_prefers_kirocli_scope() {
        let file = sqlite_fixture(&[
            ("kirocli:odic:token", r#"{"refresh_token":"rt_new"}"#),
            ("codewhisperer:odic:token", r#"{"refresh_token":"rt_legacy"}"#),
        ]);
        let store = SqliteStore::new(file.path());
        let cred = store.load().unwrap().unwrap();
        assert_eq!(cred.refresh_token, "rt_new");
    }

    #[test]
    fn sqlite_store_falls_back_to_codewhisperer_scope() {
        let file = sqlite_fixture(&[(
            "codewhisperer:odic:token",
            r#"{"refresh_token":"rt_legacy","region":"eu-west-1"}"#,
        )]);
        let store = SqliteStore::new(file.path());
        let cred = store.load().unwrap().unwrap();
        assert_eq!(cred.refresh_token, "rt_legacy");
        assert_eq!(cred.sso_region.as_deref(), Some("eu-west-1"));

        // write-back lands under the scope the credential came from
        store.save(&cred).unwrap();
        let conn = Connection::open(file.path()).unwrap();
        let value: String = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = 'codewhisperer:odic:token'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(value.contains("rt_legacy"));
    }

    #[test]
    fn sqlite_store_reads_device_registration() {
        let file = sqlite_fixture(&[
            ("kirocli:odic:token", r#"{"refresh_token":"rt"}"#),
            (
                "kirocli:odic:device-registration",
                r#"{"client_id":"cid","client_secret":"csec"}"#,
            ),
        ]);
        let cred = SqliteStore::new(file.path()).load().unwrap().unwrap();
        assert_eq!(cred.provider(), AuthProvider::Oidc);
    }

    #[test]
    fn sqlite_expired_access_token_is_discarded() {
        let file = sqlite_fixture(&[(
            "kirocli:odic:token",
            r#"{"refresh_token":"rt","access_token":"stale","expires_at":"2020-01-01T00:00:00Z"}"#,
        )]);
        let cred = SqliteStore::new(file.path()).load().unwrap().unwrap();
        assert!(cred.access_token.is_none());
    }

    #[test]
    fn env_store_save_is_a_noop() {
        let store = EnvStore::new(Some("rt".into()), None);
        let cred = store.load().unwrap().unwrap();
        assert_eq!(cred.source, CredentialSource::Env);
        store.save(&cred).unwrap();
        store.save(&cred).unwrap();
    }

    #[test]
    fn discovery_priority_sqlite_over_file_over_env() {
        let db = sqlite_fixture(&[("kirocli:odic:token", r#"{"refresh_token":"from_db"}"#)]);
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("creds.json");
        std::fs::write(&json_path, r#"{"refreshToken":"from_file"}"#).unwrap();

        let mut config = GatewayConfig::default();
        config.refresh_token = Some("from_env".into());
        config.kiro_creds_file = Some(json_path.to_string_lossy().into_owned());
        config.kiro_cli_db_file = Some(db.path().to_string_lossy().into_owned());

        let (_, cred) = discover_credential(&config).unwrap().unwrap();
        assert_eq!(cred.refresh_token, "from_db");

        config.kiro_cli_db_file = None;
        let (_, cred) = discover_credential(&config).unwrap().unwrap();
        assert_eq!(cred.refresh_token, "from_file");

        config.kiro_creds_file = None;
        let (_, cred) = discover_credential(&config).unwrap().unwrap();
        assert_eq!(cred.refresh_token, "from_env");
    }
}
