//! Model hub access tokens.
//!
//! Two storage backends sit behind [`CredentialStore`]:
//! - `KeyringCredentialStore`: the OS-native credential store (macOS Keychain,
//!   Windows Credential Manager, Linux Secret Service).
//! - `InMemoryCredentialStore`: for tests.
//!
//! [`resolve_hub_token`] checks the configured environment variable before the keyring.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::config::HubConfig;

/// Errors from credential storage operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("No token stored for {service}:{account}")]
    NotFound { service: String, account: String },

    #[error("Failed to store token: {message}")]
    StoreFailed { message: String },

    #[error("Failed to delete token: {message}")]
    DeleteFailed { message: String },

    #[error("Keyring backend not available: {message}")]
    BackendUnavailable { message: String },
}

impl From<CredentialError> for crate::error::TuneError {
    fn from(err: CredentialError) -> Self {
        Self::Credential(err.to_string())
    }
}

/// Trait for token storage backends, keyed by hub name (e.g. `huggingface`).
pub trait CredentialStore: Send + Sync {
    fn store_token(&self, hub: &str, token: &str) -> Result<(), CredentialError>;

    fn get_token(&self, hub: &str) -> Result<String, CredentialError>;

    fn delete_token(&self, hub: &str) -> Result<(), CredentialError>;

    fn has_token(&self, hub: &str) -> bool {
        self.get_token(hub).is_ok()
    }
}

/// Hub name used for the default model provider.
pub const DEFAULT_HUB: &str = "huggingface";

const SERVICE: &str = "sfttune";

/// Hub tokens in the OS keyring, one entry per hub under service `"sfttune"`.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }

    pub fn account_name(hub: &str) -> String {
        format!("hub:{hub}")
    }

    fn entry(&self, hub: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, &Self::account_name(hub)).map_err(|e| {
            CredentialError::BackendUnavailable {
                message: e.to_string(),
            }
        })
    }

    /// `NoEntry` becomes `NotFound`; anything else goes through `other`.
    fn keyring_error(
        &self,
        hub: &str,
        err: keyring::Error,
        other: fn(String) -> CredentialError,
    ) -> CredentialError {
        match err {
            keyring::Error::NoEntry => not_found(&self.service, hub),
            err => other(err.to_string()),
        }
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(service: &str, hub: &str) -> CredentialError {
    CredentialError::NotFound {
        service: service.to_string(),
        account: KeyringCredentialStore::account_name(hub),
    }
}

fn store_failed(message: String) -> CredentialError {
    CredentialError::StoreFailed { message }
}

fn delete_failed(message: String) -> CredentialError {
    CredentialError::DeleteFailed { message }
}

impl CredentialStore for KeyringCredentialStore {
    fn store_token(&self, hub: &str, token: &str) -> Result<(), CredentialError> {
        self.entry(hub)?
            .set_password(token)
            .map_err(|e| store_failed(e.to_string()))
    }

    fn get_token(&self, hub: &str) -> Result<String, CredentialError> {
        self.entry(hub)?
            .get_password()
            .map_err(|e| self.keyring_error(hub, e, store_failed))
    }

    fn delete_token(&self, hub: &str) -> Result<(), CredentialError> {
        self.entry(hub)?
            .delete_credential()
            .map_err(|e| self.keyring_error(hub, e, delete_failed))
    }
}

/// Process-local store with the same not-found behavior as the keyring.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> Result<MutexGuard<'_, HashMap<String, String>>, CredentialError> {
        self.tokens.lock().map_err(|e| store_failed(e.to_string()))
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn store_token(&self, hub: &str, token: &str) -> Result<(), CredentialError> {
        self.tokens()?.insert(hub.to_string(), token.to_string());
        Ok(())
    }

    fn get_token(&self, hub: &str) -> Result<String, CredentialError> {
        self.tokens()?
            .get(hub)
            .cloned()
            .ok_or_else(|| not_found(SERVICE, hub))
    }

    fn delete_token(&self, hub: &str) -> Result<(), CredentialError> {
        self.tokens()?
            .remove(hub)
            .map(drop)
            .ok_or_else(|| not_found(SERVICE, hub))
    }
}

/// Where a resolved token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Environment,
    Keyring,
}

/// A hub access token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct HubToken {
    secret: String,
    pub source: TokenSource,
}

impl HubToken {
    pub fn new(secret: impl Into<String>, source: TokenSource) -> Self {
        Self {
            secret: secret.into(),
            source,
        }
    }

    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for HubToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubToken")
            .field("secret", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// Find a hub token: `env_lookup(hub.token_env)` first, then the store.
///
/// `env_lookup` is injected so callers decide how the environment is read.
pub fn resolve_hub_token<F>(
    hub: &HubConfig,
    store: &dyn CredentialStore,
    env_lookup: F,
) -> Option<HubToken>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = env_lookup(&hub.token_env) {
        if !value.trim().is_empty() {
            return Some(HubToken::new(value.trim(), TokenSource::Environment));
        }
    }
    match store.get_token(DEFAULT_HUB) {
        Ok(token) => Some(HubToken::new(token, TokenSource::Keyring)),
        Err(CredentialError::NotFound { .. }) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read hub token from the credential store");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_retrieve_token() {
        let store = InMemoryCredentialStore::new();
        store.store_token(DEFAULT_HUB, "hf_abc").unwrap();
        assert_eq!(store.get_token(DEFAULT_HUB).unwrap(), "hf_abc");
        assert!(store.has_token(DEFAULT_HUB));
    }

    #[test]
    fn test_delete_token() {
        let store = InMemoryCredentialStore::new();
        store.store_token(DEFAULT_HUB, "hf_abc").unwrap();
        store.delete_token(DEFAULT_HUB).unwrap();
        assert!(matches!(
            store.get_token(DEFAULT_HUB),
            Err(CredentialError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_token(DEFAULT_HUB),
            Err(CredentialError::NotFound { .. })
        ));
    }

    #[test]
    fn test_account_name_format() {
        assert_eq!(
            KeyringCredentialStore::account_name("huggingface"),
            "hub:huggingface"
        );
    }

    #[test]
    fn test_env_takes_precedence_over_store() {
        let store = InMemoryCredentialStore::new();
        store.store_token(DEFAULT_HUB, "hf_keyring").unwrap();
        let hub = HubConfig::default();

        let token = resolve_hub_token(&hub, &store, |name| {
            (name == "HF_TOKEN").then(|| "hf_env".to_string())
        })
        .unwrap();
        assert_eq!(token.expose(), "hf_env");
        assert_eq!(token.source, TokenSource::Environment);
    }

    #[test]
    fn test_blank_env_falls_through_to_store() {
        let store = InMemoryCredentialStore::new();
        store.store_token(DEFAULT_HUB, "hf_keyring").unwrap();
        let token =
            resolve_hub_token(&HubConfig::default(), &store, |_| Some("  ".to_string())).unwrap();
        assert_eq!(token.source, TokenSource::Keyring);
    }

    #[test]
    fn test_no_token_anywhere() {
        let store = InMemoryCredentialStore::new();
        assert!(resolve_hub_token(&HubConfig::default(), &store, |_| None).is_none());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let token = HubToken::new("hf_secret", TokenSource::Keyring);
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("hf_secret"));
    }
}
