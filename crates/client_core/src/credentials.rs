use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::domain::UserId;
use tracing::{info, warn};

use crate::error::{ChatError, Result};

pub const USER_ID_KEY: &str = "userId";
pub const SESSION_TOKEN_KEY: &str = "sessionToken";

/// Persisted string key-value storage that survives app restarts.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// A flat JSON object on disk. Writes go to a sibling temp file first and
/// are renamed into place.
pub struct FileKeyValueStore {
    path: PathBuf,
    write_gate: tokio::sync::Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> anyhow::Result<HashMap<String, String>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("corrupt key-value file {}", self.path.display()))
    }

    async fn write_all(&self, entries: &HashMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create parent directory '{}'", parent.display())
            })?;
        }
        let tmp = self.path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    async fn update(&self, apply: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let mut entries = self.read_all().await.map_err(storage_error)?;
        apply(&mut entries);
        self.write_all(&entries).await.map_err(storage_error)
    }
}

fn storage_error(err: anyhow::Error) -> ChatError {
    ChatError::Storage(format!("{err:#}"))
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.read_all().await.map_err(storage_error)?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(key);
        })
        .await
    }
}

/// Identity and bearer token of the signed-in user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: UserId,
    pub token: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct CredentialProvider {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialProvider {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn get_credential(&self) -> Result<Credential> {
        let token = self.store.get(SESSION_TOKEN_KEY).await?;
        let user_id = self.store.get(USER_ID_KEY).await?;
        let (Some(token), Some(user_id)) = (token, user_id) else {
            return Err(ChatError::NotAuthenticated);
        };
        if token.trim().is_empty() {
            return Err(ChatError::NotAuthenticated);
        }
        let user_id = match user_id.trim().parse::<i64>() {
            Ok(id) => UserId(id),
            Err(err) => {
                warn!("credentials: stored user id is not numeric: {err}");
                return Err(ChatError::NotAuthenticated);
            }
        };
        Ok(Credential { user_id, token })
    }

    pub async fn store_credential(&self, credential: &Credential) -> Result<()> {
        self.store
            .set(USER_ID_KEY, &credential.user_id.0.to_string())
            .await?;
        self.store.set(SESSION_TOKEN_KEY, &credential.token).await?;
        info!(user_id = credential.user_id.0, "credentials: session stored");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(SESSION_TOKEN_KEY).await?;
        self.store.remove(USER_ID_KEY).await?;
        info!("credentials: session cleared");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
