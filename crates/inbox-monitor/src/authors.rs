//! Notifiable authors: which senders get a notification
//!
//! A JSON array of lower-cased addresses on disk. An empty list means
//! everyone is notifiable. Writes go through a temp file and a rename.

use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::AuthorsError;

type AuthorsResult<T> = std::result::Result<T, AuthorsError>;

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Persistent allow-list of sender addresses.
pub struct NotifiableAuthors {
    path: PathBuf,
    authors: RwLock<Vec<String>>,
}

impl NotifiableAuthors {
    /// Load the list from `path`.
    ///
    /// A missing file is an empty list. So is an unreadable one, with a
    /// warning; it is overwritten on the next change.
    pub async fn load(path: PathBuf) -> Self {
        let authors = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Vec<String>>(&contents) {
                Ok(list) => {
                    let mut authors: Vec<String> = Vec::with_capacity(list.len());
                    for email in list.iter().map(|e| normalize(e)) {
                        if !email.is_empty() && !authors.contains(&email) {
                            authors.push(email);
                        }
                    }
                    info!(path = %path.display(), count = authors.len(), "loaded notifiable authors");
                    authors
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "notifiable authors file is invalid, starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no notifiable authors file, notifying for every sender");
                Vec::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read notifiable authors, starting empty");
                Vec::new()
            }
        };
        Self {
            path,
            authors: RwLock::new(authors),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Vec<String> {
        self.authors.read().await.clone()
    }

    /// Add an address. Returns the updated list.
    pub async fn add(&self, email: &str) -> AuthorsResult<Vec<String>> {
        let email = normalize(email);
        if email.is_empty() {
            return Err(AuthorsError::Invalid(email));
        }
        let mut authors = self.authors.write().await;
        if authors.contains(&email) {
            return Err(AuthorsError::Duplicate(email));
        }
        let mut updated = authors.clone();
        updated.push(email.clone());
        save(&self.path, &updated).await?;
        *authors = updated;
        info!(email, "added notifiable author");
        Ok(authors.clone())
    }

    /// Remove an address. Returns the updated list.
    pub async fn remove(&self, email: &str) -> AuthorsResult<Vec<String>> {
        let email = normalize(email);
        if email.is_empty() {
            return Err(AuthorsError::Invalid(email));
        }
        let mut authors = self.authors.write().await;
        let Some(index) = authors.iter().position(|a| *a == email) else {
            return Err(AuthorsError::NotFound(email));
        };
        let mut updated = authors.clone();
        updated.remove(index);
        save(&self.path, &updated).await?;
        *authors = updated;
        info!(email, "removed notifiable author");
        Ok(authors.clone())
    }

    /// Whether a message from `address` should be notified.
    pub async fn allows(&self, address: &str) -> bool {
        let authors = self.authors.read().await;
        authors.is_empty() || authors.contains(&normalize(address))
    }
}

async fn save(path: &Path, authors: &[String]) -> AuthorsResult<()> {
    let json = serde_json::to_string_pretty(authors).map_err(|e| AuthorsError::Io(e.to_string()))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let tmp_path = dir.join(format!(".notifiable_authors.tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| AuthorsError::Io(format!("writing temp file: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| AuthorsError::Io(format!("renaming temp file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn empty(dir: &tempfile::TempDir) -> NotifiableAuthors {
        NotifiableAuthors::load(dir.path().join("notifiable_authors.json")).await
    }

    #[tokio::test]
    async fn missing_file_allows_everyone() {
        let dir = tempfile::tempdir().unwrap();
        let authors = empty(&dir).await;
        assert!(authors.list().await.is_empty());
        assert!(authors.allows("anyone@example.com").await);
    }

    #[tokio::test]
    async fn add_normalizes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let authors = empty(&dir).await;

        let list = authors.add("  Boss@Example.COM ").await.unwrap();
        assert_eq!(list, vec!["boss@example.com"]);

        let reloaded = NotifiableAuthors::load(authors.path().to_path_buf()).await;
        assert_eq!(reloaded.list().await, vec!["boss@example.com"]);
    }

    #[tokio::test]
    async fn non_empty_list_filters_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let authors = empty(&dir).await;
        authors.add("boss@example.com").await.unwrap();

        assert!(authors.allows("BOSS@example.com").await);
        assert!(!authors.allows("newsletter@example.com").await);
    }

    #[tokio::test]
    async fn duplicates_and_blank_input_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let authors = empty(&dir).await;
        authors.add("a@example.com").await.unwrap();

        assert_eq!(
            authors.add("A@example.com").await.unwrap_err(),
            AuthorsError::Duplicate("a@example.com".into())
        );
        assert!(matches!(authors.add("   ").await, Err(AuthorsError::Invalid(_))));
        assert_eq!(authors.list().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let authors = empty(&dir).await;
        authors.add("a@example.com").await.unwrap();

        assert_eq!(
            authors.remove("b@example.com").await.unwrap_err(),
            AuthorsError::NotFound("b@example.com".into())
        );
        assert!(authors.remove(" A@Example.com").await.unwrap().is_empty());
        assert!(authors.allows("b@example.com").await, "empty list allows everyone again");
    }

    #[tokio::test]
    async fn invalid_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifiable_authors.json");
        std::fs::write(&path, "{ not a list").unwrap();

        let authors = NotifiableAuthors::load(path).await;
        assert!(authors.list().await.is_empty());
    }

    #[tokio::test]
    async fn failed_save_leaves_list_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let authors = NotifiableAuthors::load(blocker.join("authors.json")).await;

        assert!(matches!(authors.add("a@example.com").await, Err(AuthorsError::Io(_))));
        assert!(authors.list().await.is_empty());
    }
}
