//! Credential storage for the serialized token bundle
//!
//! `CredentialStore` is the secret store seam: blobs keyed by a service key
//! and an account key. `FileCredentialStore` keeps them in a JSON file with
//! atomic temp-file + rename writes. A tokio Mutex serializes writers so a
//! refresh and a sign-out never interleave their writes.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key/value secret store holding one blob per `(service, account)`.
pub trait CredentialStore: Send + Sync {
    fn put<'a>(
        &'a self,
        service: &'a str,
        account: &'a str,
        blob: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>>;

    fn get<'a>(
        &'a self,
        service: &'a str,
        account: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<String>>> + Send + 'a>>;

    /// Returns whether an entry existed.
    fn delete<'a>(
        &'a self,
        service: &'a str,
        account: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<bool>> + Send + 'a>>;
}

fn entry_key(service: &str, account: &str) -> String {
    format!("{service}/{account}")
}

/// JSON file backed credential store.
///
/// The file is read lazily on first access so a missing or locked file
/// surfaces as `StoreError::Unavailable` at the call that needed it, not at
/// construction.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<Option<HashMap<String, String>>>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(path: &Path) -> StoreResult<HashMap<String, String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => {
                let entries: HashMap<String, String> = serde_json::from_str(&contents)
                    .map_err(|e| {
                        StoreError::Unavailable(format!("parsing credential file: {e}"))
                    })?;
                info!(path = %path.display(), entries = entries.len(), "loaded credential file");
                Ok(entries)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "credential file not found, starting empty");
                Ok(HashMap::new())
            }
            Err(e) => Err(StoreError::Unavailable(format!(
                "reading credential file: {e}"
            ))),
        }
    }

    async fn put_entry(&self, key: String, blob: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(Self::load(&self.path).await?);
        }
        let mut entries = state.clone().unwrap_or_default();
        entries.insert(key.clone(), blob.to_string());
        write_atomic(&self.path, &entries).await?;
        *state = Some(entries);
        debug!(key, "stored credential");
        Ok(())
    }

    async fn get_entry(&self, key: String) -> StoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(Self::load(&self.path).await?);
        }
        Ok(state.as_ref().and_then(|entries| entries.get(&key).cloned()))
    }

    async fn delete_entry(&self, key: String) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(Self::load(&self.path).await?);
        }
        let mut entries = state.clone().unwrap_or_default();
        if entries.remove(&key).is_none() {
            return Ok(false);
        }
        write_atomic(&self.path, &entries).await?;
        *state = Some(entries);
        debug!(key, "deleted credential");
        Ok(true)
    }
}

impl CredentialStore for FileCredentialStore {
    fn put<'a>(
        &'a self,
        service: &'a str,
        account: &'a str,
        blob: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>> {
        Box::pin(self.put_entry(entry_key(service, account), blob))
    }

    fn get<'a>(
        &'a self,
        service: &'a str,
        account: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<String>>> + Send + 'a>> {
        Box::pin(self.get_entry(entry_key(service, account)))
    }

    fn delete<'a>(
        &'a self,
        service: &'a str,
        account: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<bool>> + Send + 'a>> {
        Box::pin(self.delete_entry(entry_key(service, account)))
    }
}

/// Write the entries atomically with 0600 permissions.
///
/// Temp file in the same directory, then rename over the target, so a crash
/// mid-write leaves the previous file intact.
async fn write_atomic(path: &Path, entries: &HashMap<String, String>) -> StoreResult<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| StoreError::Unavailable(format!("serializing credentials: {e}")))?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StoreError::Unavailable(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("setting credential file permissions: {e}"))
            })?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::Unavailable(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
