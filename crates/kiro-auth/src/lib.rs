//! Credential handling for the Kiro upstream.
//!
//! Flow:
//!   1. Startup discovers a refresh credential (SQLite > JSON file > env).
//!   2. The credential manager exchanges it for short-lived access tokens
//!      through the provider-appropriate identity adapter.
//!   3. Refreshed tokens (and rotated refresh tokens) are written back to
//!      the source they were loaded from.

pub mod adapter;
pub mod credential;
pub mod manager;
pub mod store;

pub use adapter::RefreshAdapter;
pub use credential::{AuthError, AuthProvider, CredentialSource, RefreshCredential};
pub use manager::CredentialManager;
pub use store::{discover_credential, CredentialStore};
