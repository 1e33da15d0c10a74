use crate::error::RagError;
use crate::models::COLLECTION_PREFIX;
use crate::vector_store::{Collection, CollectionManifest, CollectionRecord, VectorStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MANIFEST_FILE: &str = "manifest.json";
const RECORDS_FILE: &str = "records.json";
const STAGING_PREFIX: &str = ".staging.";
const RETIRED_PREFIX: &str = ".retired.";

/// One directory per collection under `root`. A rebuild is written to a staging directory
/// and swapped in by rename, so a half-written collection is never visible under its name.
/// Removing a collection directory by hand is the same as dropping it.
pub struct LocalVectorStore {
    root: PathBuf,
    loaded: RwLock<HashMap<String, Arc<Collection>>>,
}

impl LocalVectorStore {
    /// Opens (creating if needed) the store at `root` and recovers from interrupted swaps.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RagError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let store = Self {
            root,
            loaded: RwLock::new(HashMap::new()),
        };
        store.recover().await?;
        Ok(store)
    }

    pub fn collection_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn recover(&self) -> Result<(), RagError> {
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            if file_name.starts_with(STAGING_PREFIX) {
                warn!(path = %path.display(), "removing abandoned staging collection");
                fs::remove_dir_all(&path).await?;
                continue;
            }

            if let Some(rest) = file_name.strip_prefix(RETIRED_PREFIX) {
                // `.retired.<uuid>.<name>`; names never contain dots.
                let name = rest.rsplit('.').next().unwrap_or_default();
                let live = self.collection_dir(name);
                if !name.is_empty() && !fs::try_exists(&live).await? {
                    warn!(collection = name, "restoring collection from interrupted swap");
                    fs::rename(&path, &live).await?;
                } else {
                    fs::remove_dir_all(&path).await?;
                }
            }
        }
        Ok(())
    }

    async fn read_collection(&self, dir: &Path) -> Result<Collection, RagError> {
        let manifest_raw = fs::read(dir.join(MANIFEST_FILE)).await?;
        let records_raw = fs::read(dir.join(RECORDS_FILE)).await?;
        let manifest: CollectionManifest = serde_json::from_slice(&manifest_raw)?;
        let records: Vec<CollectionRecord> = serde_json::from_slice(&records_raw)?;
        Collection::from_parts(manifest, records)
    }

    async fn write_staging(&self, collection: &Collection) -> Result<PathBuf, RagError> {
        let staging = self
            .root
            .join(format!("{STAGING_PREFIX}{}.{}", Uuid::new_v4(), collection.name()));
        fs::create_dir_all(&staging).await?;

        let records = serde_json::to_vec(collection.records())?;
        let manifest = serde_json::to_vec_pretty(collection.manifest())?;
        // Records first: a staging directory with a manifest is complete.
        fs::write(staging.join(RECORDS_FILE), records).await?;
        fs::write(staging.join(MANIFEST_FILE), manifest).await?;
        Ok(staging)
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn replace_collection(&self, collection: Collection) -> Result<Arc<Collection>, RagError> {
        let name = collection.name().to_string();
        let staging = match self.write_staging(&collection).await {
            Ok(path) => path,
            Err(error) => {
                warn!(collection = %name, %error, "failed to stage collection");
                return Err(error);
            }
        };

        let live = self.collection_dir(&name);
        let collection = Arc::new(collection);
        let mut loaded = self.loaded.write().await;

        let retired = if fs::try_exists(&live).await? {
            let retired = self
                .root
                .join(format!("{RETIRED_PREFIX}{}.{name}", Uuid::new_v4()));
            fs::rename(&live, &retired).await?;
            Some(retired)
        } else {
            None
        };

        if let Err(error) = fs::rename(&staging, &live).await {
            if let Some(retired) = &retired {
                fs::rename(retired, &live).await?;
            }
            // Best effort; `recover` also removes leftovers on the next open.
            let _ = fs::remove_dir_all(&staging).await;
            return Err(error.into());
        }

        loaded.insert(name.clone(), Arc::clone(&collection));
        drop(loaded);

        if let Some(retired) = retired {
            if let Err(error) = fs::remove_dir_all(&retired).await {
                warn!(path = %retired.display(), %error, "failed to remove retired collection");
            }
        }

        info!(collection = %name, records = collection.len(), "collection committed");
        Ok(collection)
    }

    async fn load_collection(&self, name: &str) -> Result<Option<Arc<Collection>>, RagError> {
        let dir = self.collection_dir(name);
        {
            let loaded = self.loaded.read().await;
            if fs::try_exists(dir.join(MANIFEST_FILE)).await? {
                if let Some(collection) = loaded.get(name) {
                    return Ok(Some(Arc::clone(collection)));
                }
            } else {
                drop(loaded);
                self.loaded.write().await.remove(name);
                return Ok(None);
            }
        }

        let mut loaded = self.loaded.write().await;
        if let Some(collection) = loaded.get(name) {
            return Ok(Some(Arc::clone(collection)));
        }
        if !fs::try_exists(dir.join(MANIFEST_FILE)).await? {
            return Ok(None);
        }

        let collection = Arc::new(self.read_collection(&dir).await?);
        debug!(collection = name, records = collection.len(), "collection loaded from disk");
        loaded.insert(name.to_string(), Arc::clone(&collection));
        Ok(Some(collection))
    }

    async fn drop_collection(&self, name: &str) -> Result<bool, RagError> {
        let mut loaded = self.loaded.write().await;
        loaded.remove(name);

        let dir = self.collection_dir(name);
        if !fs::try_exists(&dir).await? {
            return Ok(false);
        }

        fs::remove_dir_all(&dir).await?;
        info!(collection = name, "collection dropped");
        Ok(true)
    }

    async fn list_collections(&self) -> Result<Vec<String>, RagError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(COLLECTION_PREFIX)
                && fs::try_exists(entry.path().join(MANIFEST_FILE)).await?
            {
                names.push(name);
            }
        }
        names.sort_unstable();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Document};
    use crate::vector_store::CollectionWriter;
    use chrono::Utc;
    use tempfile::tempdir;

    fn collection(name: &str, texts: &[&str]) -> Collection {
        let mut writer = CollectionWriter::new(name, 2);
        for (index, text) in texts.iter().enumerate() {
            writer
                .append(
                    Chunk {
                        document_id: "7".to_string(),
                        page: 1,
                        sequence: index as u64,
                        content_hash: format!("h{index}"),
                        text: text.to_string(),
                    },
                    vec![1.0, index as f32],
                )
                .expect("dimension matches");
        }
        let document = Document {
            document_id: "7".to_string(),
            source_path: "/tmp/7.txt".to_string(),
            checksum: "abc".to_string(),
            page_count: 1,
            indexed_at: Utc::now(),
        };
        writer.seal(document, "test-model").expect("non-empty")
    }

    #[tokio::test]
    async fn committed_collections_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = LocalVectorStore::open(dir.path()).await?;
        store.replace_collection(collection("doc_7", &["a", "b"])).await?;

        let reopened = LocalVectorStore::open(dir.path()).await?;
        let loaded = reopened.load_collection("doc_7").await?.expect("collection exists");
        assert_eq!(loaded.len(), 2);
        assert_eq!(reopened.list_collections().await?, vec!["doc_7".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn replace_swaps_whole_collection() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = LocalVectorStore::open(dir.path()).await?;
        store.replace_collection(collection("doc_7", &["a", "b", "c"])).await?;
        store.replace_collection(collection("doc_7", &["z"])).await?;

        let loaded = store.load_collection("doc_7").await?.expect("collection exists");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.records()[0].chunk.text, "z");

        let leftovers = std::fs::read_dir(dir.path())?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn removing_the_directory_drops_the_collection() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = LocalVectorStore::open(dir.path()).await?;
        store.replace_collection(collection("doc_7", &["a"])).await?;
        assert!(store.load_collection("doc_7").await?.is_some());

        std::fs::remove_dir_all(dir.path().join("doc_7"))?;
        assert!(store.load_collection("doc_7").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn drop_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = LocalVectorStore::open(dir.path()).await?;
        store.replace_collection(collection("doc_7", &["a"])).await?;

        assert!(store.drop_collection("doc_7").await?);
        assert!(!store.drop_collection("doc_7").await?);
        assert!(store.list_collections().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_swaps_are_recovered_on_open() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = LocalVectorStore::open(dir.path()).await?;
        store.replace_collection(collection("doc_7", &["a"])).await?;

        std::fs::rename(dir.path().join("doc_7"), dir.path().join(".retired.abc.doc_7"))?;
        std::fs::create_dir(dir.path().join(".staging.def.doc_7"))?;

        let reopened = LocalVectorStore::open(dir.path()).await?;
        assert!(reopened.load_collection("doc_7").await?.is_some());
        assert!(!dir.path().join(".staging.def.doc_7").exists());
        Ok(())
    }
}
