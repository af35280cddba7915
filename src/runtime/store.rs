use std::io;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::ConfigStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("Malformed entry {key} in collection {collection}: {source}")]
    MalformedEntry {
        collection: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Collections stored as `config/<collection>` files under a directory.
///
/// Each line is `<key> <json>`; the first line for a key wins.
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        if collection.is_empty() || collection.contains(['/', '\\']) || collection.starts_with('.')
        {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }
        let path = self.dir.join("config").join(collection);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for line in contents.lines() {
            let Some((id, json)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            if id == key {
                let value = serde_json::from_str(json.trim_start()).map_err(|source| {
                    StoreError::MalformedEntry {
                        collection: collection.to_string(),
                        key: key.to_string(),
                        source,
                    }
                })?;
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.read(collection, key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with(contents: &str) -> (FileConfigStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "reparto-store-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        tokio::fs::create_dir_all(dir.join("config")).await.unwrap();
        tokio::fs::write(dir.join("config").join("roles"), contents)
            .await
            .unwrap();
        (FileConfigStore::new(&dir), dir)
    }

    #[tokio::test]
    async fn reads_a_keyed_json_line() {
        let (store, dir) = store_with(
            "abc {\"_id\":\"abc\",\"apps\":[\"api\"]}\nefg {\"apps\":[\"web\"]}\n",
        )
        .await;
        assert_eq!(
            store.get("roles", "efg").await.unwrap(),
            Some(json!({"apps": ["web"]}))
        );
        assert_eq!(store.get("roles", "zzz").await.unwrap(), None);
        assert_eq!(store.get("missing", "abc").await.unwrap(), None);
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn malformed_entry_is_an_error() {
        let (store, dir) = store_with("abc {not json\n").await;
        assert!(store.get("roles", "abc").await.is_err());
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn rejects_path_like_collections() {
        let store = FileConfigStore::new("/nonexistent");
        assert!(store.get("../etc", "abc").await.is_err());
    }
}
