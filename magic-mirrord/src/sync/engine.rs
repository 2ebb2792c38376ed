use std::sync::Arc;

use magic_api_core::{FileEntity, GroupEntity, MagicApiError};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::meta::{MetaError, MirrorFileMeta, MirrorRootMeta};
use super::paths::{PathError, ResourceKey};
use super::remote::RemoteStore;
use super::store::{MirrorStore, StoreError, WriteOrigin};
use super::tree_cache::{CacheError, TreeCache};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Remote(#[from] MagicApiError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("invalid sidecar: {0}")]
    Invalid(#[from] MetaError),
    #[error("local script missing for {0}")]
    MissingLocal(ResourceKey),
    #[error("remote resource missing: {0}")]
    MissingRemote(String),
    #[error("cancelled")]
    Cancelled,
}

/// Everything one mirror root needs, passed explicitly to every operation.
pub struct SyncContext<R> {
    pub(crate) remote: Arc<R>,
    pub(crate) cache: TreeCache<R>,
    pub(crate) store: Arc<MirrorStore>,
    pub(crate) types: Vec<String>,
}

impl<R: RemoteStore> SyncContext<R> {
    pub fn new(remote: Arc<R>, store: Arc<MirrorStore>, types: Vec<String>) -> Self {
        Self {
            cache: TreeCache::new(Arc::clone(&remote), types.clone()),
            remote,
            store,
            types,
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn cache(&self) -> &TreeCache<R> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// Returns the id of the group at `kind/group_sub`, creating missing
    /// ancestors top-down. The cache is refreshed after each creation so the
    /// next level can be placed under it.
    pub async fn ensure_group_chain(
        &self,
        kind: &str,
        group_sub: &str,
    ) -> Result<String, EngineError> {
        let mut parent_id = self
            .cache
            .resolve_group_id(kind, "")
            .await?
            .ok_or_else(|| EngineError::MissingRemote(kind.to_string()))?;
        let mut sub = String::new();
        for segment in group_sub.split('/').filter(|segment| !segment.is_empty()) {
            if !sub.is_empty() {
                sub.push('/');
            }
            sub.push_str(segment);
            if let Some(id) = self.cache.resolve_group_id(kind, &sub).await? {
                parent_id = id;
                continue;
            }
            let group = GroupEntity {
                name: segment.to_string(),
                kind: kind.to_string(),
                parent_id: Some(parent_id.clone()),
                path: Some(segment.to_string()),
                ..Default::default()
            };
            let id = self.remote.save_group(&group).await?;
            info!(kind, group = %sub, id = %id, "remote group created");
            self.cache.refresh().await?;
            parent_id = id;
        }
        Ok(parent_id)
    }

    /// Pushes the mirror copy of `key` using its stored sidecar.
    pub async fn push(&self, key: &ResourceKey) -> Result<MirrorFileMeta, EngineError> {
        let script = self
            .store
            .read_script(key)
            .await?
            .ok_or_else(|| EngineError::MissingLocal(key.clone()))?;
        let meta = match self.store.read_meta(key).await? {
            Some(meta) => meta,
            None => MirrorFileMeta::for_new(key),
        };
        self.push_with(key, &script, meta).await
    }

    /// Saves `script` and `meta` remotely: by id when known, else by path
    /// lookup, else as a new resource. A sidecar id the server no longer has
    /// is dropped. The sidecar is rewritten from the server's post-write
    /// snapshot.
    pub async fn push_with(
        &self,
        key: &ResourceKey,
        script: &str,
        mut meta: MirrorFileMeta,
    ) -> Result<MirrorFileMeta, EngineError> {
        meta.pin_to(key);
        meta.validate()?;
        let group_id = self.ensure_group_chain(&key.kind, &key.group_sub).await?;
        let known_id = match meta.id.take() {
            Some(id) if self.cache.file_exists(&id).await? => Some(id),
            Some(stale) => {
                warn!(key = %key, id = %stale, "sidecar id is gone remotely, recreating");
                self.cache.resolve_file_id(key).await?
            }
            None => self.cache.resolve_file_id(key).await?,
        };

        let mut entity = meta.to_entity(Some(script.to_string()));
        entity.id = known_id.clone();
        entity.group_id = Some(group_id);
        let id = self.remote.save_file(&key.kind, &entity).await?;
        if known_id.is_none() {
            self.cache.refresh().await?;
        }

        self.store.note_synced_script(key, script)?;
        let fresh = self.remote.get_file(&id).await?;
        let written = self
            .store
            .write_meta(
                key,
                &MirrorFileMeta::from_remote(key, &fresh),
                WriteOrigin::Local,
            )
            .await?;
        info!(key = %key, id = %id, created = known_id.is_none(), "pushed");
        Ok(written)
    }

    pub async fn pull(&self, key: &ResourceKey, id: &str) -> Result<MirrorFileMeta, EngineError> {
        let file = self.remote.get_file(id).await?;
        self.pull_entity(key, &file).await
    }

    /// Materializes a remote file: group sidecars on the way, then script and
    /// sidecar. `localUpdateTime` keeps its previous value.
    pub async fn pull_entity(
        &self,
        key: &ResourceKey,
        file: &FileEntity,
    ) -> Result<MirrorFileMeta, EngineError> {
        self.write_group_chain_meta(key).await?;
        let previous = self.read_meta_or_warn(key).await;
        let mut meta = MirrorFileMeta::from_remote(key, file);
        meta.local_update_time = previous.and_then(|previous| previous.local_update_time);

        self.store
            .write_script(key, file.script.as_deref().unwrap_or_default())
            .await?;
        let written = self
            .store
            .write_meta(key, &meta, WriteOrigin::Remote)
            .await?;
        info!(key = %key, id = ?file.id, "pulled");
        Ok(written)
    }

    async fn write_group_chain_meta(&self, key: &ResourceKey) -> Result<(), EngineError> {
        let snapshot = self.cache.snapshot().await;
        let mut sub = String::new();
        for segment in key.group_segments() {
            if !sub.is_empty() {
                sub.push('/');
            }
            sub.push_str(segment);
            if self.store.read_group_meta(&key.kind, &sub).await?.is_some() {
                continue;
            }
            let Some(id) = snapshot.group_id(&key.kind, &sub) else {
                continue;
            };
            let group = self.remote.get_group(id).await?;
            let raw = serde_json::to_value(&group).unwrap_or_default();
            self.store.write_group_meta(&key.kind, &sub, &raw).await?;
        }
        Ok(())
    }

    /// Deletes the remote counterpart of `key` and drops its sidecar.
    pub async fn delete_remote(&self, key: &ResourceKey) -> Result<bool, EngineError> {
        let id = match self.read_meta_or_warn(key).await.and_then(|meta| meta.id) {
            Some(id) => Some(id),
            None => self.cache.resolve_file_id(key).await?,
        };
        let Some(id) = id else {
            self.store.remove_meta(key).await?;
            return Ok(false);
        };
        self.remote.delete_file(&id).await?;
        self.store.remove_meta(key).await?;
        self.cache.refresh().await?;
        info!(key = %key, id = %id, "remote resource deleted");
        Ok(true)
    }

    /// Sidecar of `key` for paths that can proceed without it. A parse failure
    /// is logged rather than returned.
    async fn read_meta_or_warn(&self, key: &ResourceKey) -> Option<MirrorFileMeta> {
        match self.store.read_meta(key).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(key = %key, error = %err, "sidecar unreadable, ignoring it");
                None
            }
        }
    }

    /// Fetches workbench completion names into the root meta.
    pub async fn refresh_completion_cache(&self) -> Result<MirrorRootMeta, EngineError> {
        let completion = self.remote.fetch_workbench().await?;
        let mut root = self.store.read_root_meta().await?.unwrap_or_default();
        debug!(
            classes = completion.classes.len(),
            functions = completion.functions.len(),
            "completion data fetched"
        );
        root.completion = Some(completion);
        self.store.write_root_meta(&root).await?;
        Ok(root)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
