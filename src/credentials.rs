/*!
 * Credential Storage
 *
 * Secrets live behind the `CredentialStore` trait, keyed
 * `account_{id}_{field}`. The OS-keychain implementation goes through the
 * `keyring` crate; an in-memory variant backs tests and platforms without a
 * keychain. Values stay wrapped in `SecretString` while in memory and are
 * only exposed to build an Authorization header.
 */

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{CalendarError, CalendarResult};

pub fn account_key(account_id: &str, field: &str) -> String {
    format!("account_{account_id}_{field}")
}

pub fn subscription_key(subscription_id: &str) -> String {
    format!("ics_{subscription_id}_password")
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save(&self, key: &str, value: SecretString) -> CalendarResult<()>;
    async fn get(&self, key: &str) -> CalendarResult<Option<SecretString>>;
    async fn delete(&self, key: &str) -> CalendarResult<()>;
    async fn clear_all(&self) -> CalendarResult<()>;
    /// Probe for platforms where no secure store exists.
    fn is_available(&self) -> bool;

    /// Removes every field stored for an account. Missing entries are not
    /// an error.
    async fn delete_account(&self, account_id: &str) -> CalendarResult<()> {
        for field in ["password", "username"] {
            self.delete(&account_key(account_id, field)).await?;
        }
        Ok(())
    }
}

/// OS-keychain store. The keyring API is blocking, so every call hops onto
/// the blocking pool. Since keychains cannot enumerate entries, an index
/// entry tracks known keys for `clear_all`.
pub struct KeyringCredentialStore {
    service: String,
}

const INDEX_KEY: &str = "credential_index";

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> CalendarResult<keyring::Entry> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| CalendarError::other(format!("keyring entry: {e}")))
    }

    async fn read_index(&self) -> Vec<String> {
        match self.get(INDEX_KEY).await {
            Ok(Some(value)) => {
                serde_json::from_str(value.expose_secret()).unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    async fn write_index(&self, keys: &[String]) {
        if let Ok(serialized) = serde_json::to_string(keys) {
            let service = self.service.clone();
            let _ = tokio::task::spawn_blocking(move || {
                keyring::Entry::new(&service, INDEX_KEY)
                    .and_then(|entry| entry.set_password(&serialized))
            })
            .await;
        }
    }
}

#[async_trait]
impl CredentialStore for KeyringCredentialStore {
    async fn save(&self, key: &str, value: SecretString) -> CalendarResult<()> {
        let entry = self.entry(key)?;
        let secret = value.expose_secret().to_string();
        tokio::task::spawn_blocking(move || entry.set_password(&secret))
            .await
            .map_err(|e| CalendarError::other(format!("keyring task: {e}")))?
            .map_err(|e| CalendarError::other(format!("keyring save: {e}")))?;

        let mut index = self.read_index().await;
        if !index.iter().any(|k| k == key) {
            index.push(key.to_string());
            self.write_index(&index).await;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> CalendarResult<Option<SecretString>> {
        let entry = self.entry(key)?;
        let result = tokio::task::spawn_blocking(move || entry.get_password())
            .await
            .map_err(|e| CalendarError::other(format!("keyring task: {e}")))?;
        match result {
            Ok(secret) => Ok(Some(SecretString::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CalendarError::other(format!("keyring read: {e}"))),
        }
    }

    async fn delete(&self, key: &str) -> CalendarResult<()> {
        let entry = self.entry(key)?;
        let result = tokio::task::spawn_blocking(move || entry.delete_password())
            .await
            .map_err(|e| CalendarError::other(format!("keyring task: {e}")))?;
        match result {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                let index: Vec<String> = self
                    .read_index()
                    .await
                    .into_iter()
                    .filter(|k| k != key)
                    .collect();
                self.write_index(&index).await;
                Ok(())
            }
            Err(e) => Err(CalendarError::other(format!("keyring delete: {e}"))),
        }
    }

    async fn clear_all(&self) -> CalendarResult<()> {
        for key in self.read_index().await {
            self.delete(&key).await?;
        }
        self.write_index(&[]).await;
        Ok(())
    }

    fn is_available(&self) -> bool {
        keyring::Entry::new(&self.service, "availability_probe").is_ok()
    }
}

/// Plain in-memory store for tests and keychain-less environments.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Arc<tokio::sync::Mutex<HashMap<String, SecretString>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save(&self, key: &str, value: SecretString) -> CalendarResult<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> CalendarResult<Option<SecretString>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> CalendarResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn clear_all(&self) -> CalendarResult<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}
