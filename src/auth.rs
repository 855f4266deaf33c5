use crate::config::OAuthConfig;
use crate::error::StoreError;
use crate::models::CredentialRecord;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use keyring::Entry;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{InstalledFlowAuthenticator, InstalledFlowReturnMethod};

const APP_NAME: &str = "mailpilot";
const TOKEN_KEY: &str = "mailbox_token";

pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.modify"];

/// Persists the mailbox token pair. Writes replace the whole record.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        ttl_secs: i64,
    ) -> Result<(), StoreError>;
    async fn load(&self) -> Result<Option<CredentialRecord>, StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;

    async fn has_credentials(&self) -> bool {
        matches!(self.load().await, Ok(Some(_)))
    }
}

fn record_for(access_token: &str, refresh_token: Option<&str>, ttl_secs: i64) -> CredentialRecord {
    CredentialRecord {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        expires_at: (Utc::now() + Duration::seconds(ttl_secs)).timestamp(),
    }
}

/// Stores the record as one JSON blob in the OS keyring.
pub struct KeyringCredentialStore {
    service: String,
    key: String,
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(APP_NAME, TOKEN_KEY)
    }
}

impl KeyringCredentialStore {
    pub fn new(service: &str, key: &str) -> Self {
        Self {
            service: service.to_string(),
            key: key.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, &self.key)?)
    }
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn save(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        ttl_secs: i64,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(&record_for(access_token, refresh_token, ttl_secs))?;
        self.entry()?.set_password(&serialized)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<CredentialRecord>, StoreError> {
        match self.entry()?.get_password() {
            Ok(serialized) => Ok(Some(serde_json::from_str(&serialized)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn with_record(record: CredentialRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        ttl_secs: i64,
    ) -> Result<(), StoreError> {
        let record = record_for(access_token, refresh_token, ttl_secs);
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(record);
        Ok(())
    }

    async fn load(&self) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self.record.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// Bridges the installed-flow authenticator to a [`CredentialStore`].
///
/// `get` never returns a cached token so an explicit login always runs the
/// consent screen and yields a fresh refresh token.
struct CredentialStorage {
    store: Arc<dyn CredentialStore>,
}

#[async_trait]
impl TokenStorage for CredentialStorage {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> anyhow::Result<()> {
        let access_token = token
            .access_token
            .context("Token response carried no access token")?;
        let ttl_secs = token
            .expires_at
            .map(|at| at.unix_timestamp() - Utc::now().timestamp())
            .unwrap_or(3600);
        self.store
            .save(&access_token, token.refresh_token.as_deref(), ttl_secs)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to persist token: {}", e))
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        None
    }
}

/// Opens the consent URL in the user's browser.
struct BrowserDelegate;

impl InstalledFlowDelegate for BrowserDelegate {
    fn present_user_url<'a>(
        &'a self,
        url: &'a str,
        need_code: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
        Box::pin(async move {
            println!("Opening browser for mailbox authorization...");
            println!("If the browser doesn't open, visit: {}", url);
            if let Err(e) = open::that(url) {
                tracing::warn!(error = %e, "Failed to open browser");
            }
            if need_code {
                Err("Manual code entry is not supported; use the redirect flow".to_string())
            } else {
                Ok(String::new())
            }
        })
    }
}

/// Takes the OAuth client id and secret from the installed-app secret file
/// when the configuration leaves them empty.
pub async fn fill_client_from_secret(oauth: &mut OAuthConfig) -> anyhow::Result<()> {
    if !oauth.client_id.is_empty() || !Path::new(&oauth.secret_path).exists() {
        return Ok(());
    }
    let secret = yup_oauth2::read_application_secret(&oauth.secret_path)
        .await
        .with_context(|| format!("Failed to read {}", oauth.secret_path))?;
    oauth.client_id = secret.client_id;
    oauth.client_secret = secret.client_secret;
    if !secret.token_uri.is_empty() {
        oauth.token_url = secret.token_uri;
    }
    Ok(())
}

/// Runs the interactive OAuth consent flow and stores the granted token pair.
pub async fn interactive_login<P: AsRef<Path>>(
    secret_path: P,
    store: Arc<dyn CredentialStore>,
) -> anyhow::Result<()> {
    let secret = yup_oauth2::read_application_secret(secret_path)
        .await
        .context("Failed to read application secret")?;

    let auth = InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
        .with_storage(Box::new(CredentialStorage { store }))
        .flow_delegate(Box::new(BrowserDelegate))
        .build()
        .await
        .context("Failed to build authenticator")?;

    auth.token(SCOPES)
        .await
        .context("Mailbox authorization failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_overwrites_and_clears() {
        let store = MemoryCredentialStore::default();
        assert!(!store.has_credentials().await);

        store.save("a1", Some("r1"), 3600).await.unwrap();
        store.save("a2", None, 60).await.unwrap();
        let record = store.load().await.unwrap().unwrap();
        assert_eq!(record.access_token, "a2");
        assert_eq!(record.refresh_token, None);
        assert!(!record.is_renewable());

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
