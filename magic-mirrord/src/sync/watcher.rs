use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use magic_api_core::{FileEntity, MagicApiError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{EngineError, SyncContext};
use super::local_watcher::MirrorEvent;
use super::meta::{MetaError, MirrorFileMeta};
use super::paths::{PathTarget, ResourceKey, locate_target};
use super::remote::RemoteStore;
use super::store::{StoreError, WriteOrigin};
use super::tree_cache::CacheError;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("remote error: {0}")]
    Remote(#[from] MagicApiError),
    #[error("invalid sidecar {path}: {source}")]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("sidecar rejected: {0}")]
    Invalid(#[from] MetaError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Edits made through the live-editing surface of the server.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    FileSaved(FileEntity),
    FileDeleted { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Ignored,
    Echo,
    Pushed(ResourceKey),
    Deleted(ResourceKey),
    Renamed { from: ResourceKey, to: ResourceKey },
    GroupCreated(String),
    GroupDeleted(String),
    GroupMoved { from: String, to: String },
    Pulled(ResourceKey),
    Removed(ResourceKey),
}

/// Incremental propagation between the mirror and the remote, one event at a time.
pub struct ChangeWatcher<R> {
    ctx: Arc<SyncContext<R>>,
}

impl<R: RemoteStore> ChangeWatcher<R> {
    pub fn new(ctx: Arc<SyncContext<R>>) -> Self {
        Self { ctx }
    }

    fn locate(&self, path: &Path) -> Option<PathTarget> {
        locate_target(self.ctx.store.root(), path, &self.ctx.types)
    }

    pub async fn dispatch(&self, event: MirrorEvent) -> Result<WatchOutcome, WatchError> {
        match event {
            MirrorEvent::Saved(path) => self.on_saved(&path, false).await,
            MirrorEvent::Created(path) => self.on_saved(&path, true).await,
            MirrorEvent::Deleted(path) => self.on_deleted(&path).await,
            MirrorEvent::Renamed { from, to } => self.on_renamed(&from, &to).await,
        }
    }

    async fn on_saved(&self, path: &Path, created: bool) -> Result<WatchOutcome, WatchError> {
        let Some(target) = self.locate(path) else {
            return Ok(WatchOutcome::Ignored);
        };
        if let PathTarget::Group { kind, group_sub } = &target {
            if !created || !tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
                return Ok(WatchOutcome::Ignored);
            }
            self.ctx.ensure_group_chain(kind, group_sub).await?;
            return Ok(WatchOutcome::GroupCreated(format!("{kind}/{group_sub}")));
        }
        if self.ctx.store.is_echo(path).await {
            return Ok(WatchOutcome::Echo);
        }
        match target {
            PathTarget::Group { .. } => Ok(WatchOutcome::Ignored),
            PathTarget::Script(key) => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Ok(WatchOutcome::Ignored);
                }
                self.ctx.push(&key).await?;
                Ok(WatchOutcome::Pushed(key))
            }
            PathTarget::Meta(key) => self.on_meta_saved(&key, path).await,
        }
    }

    /// Validates a hand-edited sidecar, merges it over the last synced one and
    /// pushes it together with the adjacent script.
    async fn on_meta_saved(
        &self,
        key: &ResourceKey,
        path: &Path,
    ) -> Result<WatchOutcome, WatchError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(WatchOutcome::Ignored);
            }
            Err(source) => {
                return Err(WatchError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let invalid = |source| WatchError::InvalidJson {
            path: path.to_path_buf(),
            source,
        };
        let edited: Value = serde_json::from_slice(&bytes).map_err(invalid)?;
        let base = self
            .ctx
            .store
            .last_written(path)
            .and_then(|previous| serde_json::from_slice::<MirrorFileMeta>(&previous).ok())
            .unwrap_or_else(|| MirrorFileMeta::for_new(key));
        let merged = base.merged_with(edited)?;
        let mut meta: MirrorFileMeta = serde_json::from_value(merged).map_err(invalid)?;
        meta.pin_to(key);
        if let Err(err) = meta.validate() {
            warn!(key = %key, error = %err, "sidecar rejected");
            return Err(err.into());
        }

        let script = self
            .ctx
            .store
            .read_script(key)
            .await?
            .ok_or_else(|| EngineError::MissingLocal(key.clone()))?;
        self.ctx.push_with(key, &script, meta).await?;
        Ok(WatchOutcome::Pushed(key.clone()))
    }

    async fn on_deleted(&self, path: &Path) -> Result<WatchOutcome, WatchError> {
        match self.locate(path) {
            Some(PathTarget::Script(key)) => {
                // A script removed together with its sidecar was removed by a remote delete.
                let meta_path = self.ctx.store.meta_path(&key)?;
                if tokio::fs::try_exists(path).await.unwrap_or(false)
                    || !tokio::fs::try_exists(&meta_path).await.unwrap_or(false)
                {
                    return Ok(WatchOutcome::Ignored);
                }
                self.ctx.delete_remote(&key).await?;
                Ok(WatchOutcome::Deleted(key))
            }
            Some(PathTarget::Group { kind, group_sub }) => {
                let Some(id) = self.ctx.cache.resolve_group_id(&kind, &group_sub).await? else {
                    return Ok(WatchOutcome::Ignored);
                };
                self.ctx.remote.delete_group(&id).await?;
                self.ctx.cache.refresh().await?;
                info!(kind = %kind, group = %group_sub, "remote group deleted");
                Ok(WatchOutcome::GroupDeleted(format!("{kind}/{group_sub}")))
            }
            Some(PathTarget::Meta(_)) | None => Ok(WatchOutcome::Ignored),
        }
    }

    async fn on_renamed(&self, from: &Path, to: &Path) -> Result<WatchOutcome, WatchError> {
        match (self.locate(from), self.locate(to)) {
            (Some(PathTarget::Script(old)), Some(PathTarget::Script(new))) => {
                self.rename_script(&old, &new).await
            }
            (
                Some(PathTarget::Group {
                    kind,
                    group_sub: old_sub,
                }),
                Some(PathTarget::Group {
                    kind: new_kind,
                    group_sub: new_sub,
                }),
            ) if kind == new_kind => self.move_group(&kind, &old_sub, &new_sub).await,
            _ => {
                let deleted = self.on_deleted(from).await?;
                let created = self.on_saved(to, true).await?;
                Ok(match created {
                    WatchOutcome::Ignored | WatchOutcome::Echo => deleted,
                    other => other,
                })
            }
        }
    }

    async fn rename_script(
        &self,
        old: &ResourceKey,
        new: &ResourceKey,
    ) -> Result<WatchOutcome, WatchError> {
        self.ctx.store.rename_meta(old, new).await?;
        let mut meta = match self.ctx.store.read_meta(new).await? {
            Some(meta) => meta,
            None => MirrorFileMeta::for_new(new),
        };
        if meta.id.is_none() {
            meta.id = self.ctx.cache.resolve_file_id(old).await?;
        }
        if meta.path.as_deref() == Some(old.name.as_str()) {
            meta.path = Some(new.name.clone());
        }
        let script = self
            .ctx
            .store
            .read_script(new)
            .await?
            .ok_or_else(|| EngineError::MissingLocal(new.clone()))?;
        self.ctx.push_with(new, &script, meta).await?;
        Ok(WatchOutcome::Renamed {
            from: old.clone(),
            to: new.clone(),
        })
    }

    /// Renames or re-parents a group, then rewrites the sidecars below it.
    async fn move_group(
        &self,
        kind: &str,
        old_sub: &str,
        new_sub: &str,
    ) -> Result<WatchOutcome, WatchError> {
        let Some(id) = self.ctx.cache.resolve_group_id(kind, old_sub).await? else {
            self.ctx.ensure_group_chain(kind, new_sub).await?;
            return Ok(WatchOutcome::GroupCreated(format!("{kind}/{new_sub}")));
        };
        let (parent_sub, name) = new_sub.rsplit_once('/').unwrap_or(("", new_sub));
        let parent_id = self.ctx.ensure_group_chain(kind, parent_sub).await?;
        let mut group = self.ctx.remote.get_group(&id).await?;
        group.name = name.to_string();
        group.parent_id = Some(parent_id);
        self.ctx.remote.save_group(&group).await?;
        self.ctx.cache.refresh().await?;

        let prefix = format!("{new_sub}/");
        for key in self.ctx.store.list_all_scripts(&self.ctx.types).await? {
            if key.kind != kind || !(key.group_sub == new_sub || key.group_sub.starts_with(&prefix))
            {
                continue;
            }
            if let Some(meta) = self.ctx.store.read_meta(&key).await? {
                self.ctx
                    .store
                    .write_meta(&key, &meta, WriteOrigin::Remote)
                    .await?;
            }
        }
        info!(kind, from = %old_sub, to = %new_sub, "remote group moved");
        Ok(WatchOutcome::GroupMoved {
            from: format!("{kind}/{old_sub}"),
            to: format!("{kind}/{new_sub}"),
        })
    }

    /// Writes a remote-originated change into the mirror.
    pub async fn apply_remote_event(&self, event: RemoteEvent) -> Result<WatchOutcome, WatchError> {
        match event {
            RemoteEvent::FileSaved(file) => {
                let Some(id) = file.id.clone() else {
                    return Ok(WatchOutcome::Ignored);
                };
                self.ctx.cache.refresh().await?;
                let Some(key) = self.key_for_id(&id).await else {
                    return Ok(WatchOutcome::Ignored);
                };
                let file = match file.script {
                    Some(_) => file,
                    None => self.ctx.remote.get_file(&id).await?,
                };
                self.ctx.pull_entity(&key, &file).await?;
                Ok(WatchOutcome::Pulled(key))
            }
            RemoteEvent::FileDeleted { id } => {
                let Some(key) = self.key_for_id(&id).await else {
                    return Ok(WatchOutcome::Ignored);
                };
                self.ctx.store.remove_meta(&key).await?;
                self.ctx.store.remove_script(&key).await?;
                self.ctx.cache.refresh().await?;
                Ok(WatchOutcome::Removed(key))
            }
        }
    }

    /// Key of a remote id, from the cache or else from the sidecars, since a
    /// deleted id is gone from any tree fetched after the delete.
    async fn key_for_id(&self, id: &str) -> Option<ResourceKey> {
        let snapshot = self.ctx.cache.snapshot().await;
        if let Some(key) = snapshot
            .files
            .path_of(id)
            .and_then(ResourceKey::parse_file_path)
        {
            return Some(key);
        }
        let keys = match self.ctx.store.list_all_scripts(&self.ctx.types).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(id, error = %err, "mirror not scanned for remote id");
                return None;
            }
        };
        for key in keys {
            if let Ok(Some(meta)) = self.ctx.store.read_meta(&key).await
                && meta.id.as_deref() == Some(id)
            {
                return Some(key);
            }
        }
        None
    }

    pub async fn run_local(
        &self,
        mut events: mpsc::UnboundedReceiver<MirrorEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match self.dispatch(event.clone()).await {
                Ok(WatchOutcome::Ignored | WatchOutcome::Echo) => {}
                Ok(outcome) => debug!(?outcome, "local change propagated"),
                Err(err) => warn!(?event, error = %err, "local change not propagated"),
            }
        }
    }

    pub async fn run_remote(
        &self,
        mut events: mpsc::UnboundedReceiver<RemoteEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match self.apply_remote_event(event).await {
                Ok(WatchOutcome::Ignored) => {}
                Ok(outcome) => debug!(?outcome, "remote change mirrored"),
                Err(err) => warn!(error = %err, "remote change not mirrored"),
            }
        }
    }
}

/// Turns server-side edits into `RemoteEvent`s by re-fetching the tree and
/// comparing each file's `updateTime` with its sidecar.
pub struct RemotePoller<R> {
    ctx: Arc<SyncContext<R>>,
    seen: HashMap<String, Option<i64>>,
}

impl<R: RemoteStore> RemotePoller<R> {
    pub fn new(ctx: Arc<SyncContext<R>>) -> Self {
        Self {
            ctx,
            seen: HashMap::new(),
        }
    }

    pub async fn poll(&mut self) -> Result<Vec<RemoteEvent>, WatchError> {
        let snapshot = self.ctx.cache.refresh().await?;
        let mut current = HashMap::new();
        let mut events = Vec::new();
        for file in snapshot.files_by_dir.values().flatten() {
            current.insert(file.id.clone(), file.update_time);
            if self.seen.get(&file.id) == Some(&file.update_time) {
                continue;
            }
            let stale = match self.ctx.store.read_meta(&file.key).await {
                Ok(Some(meta)) => meta.update_time < file.update_time,
                Ok(None) => self.ctx.store.read_script(&file.key).await?.is_none(),
                Err(err) => {
                    warn!(key = %file.key, error = %err, "sidecar unreadable, not polling it");
                    false
                }
            };
            if stale {
                events.push(RemoteEvent::FileSaved(FileEntity {
                    id: Some(file.id.clone()),
                    name: file.name.clone(),
                    group_id: Some(file.group_id.clone()),
                    update_time: file.update_time,
                    ..Default::default()
                }));
            }
        }
        for id in self.seen.keys() {
            if !current.contains_key(id) {
                events.push(RemoteEvent::FileDeleted { id: id.clone() });
            }
        }
        self.seen = current;
        Ok(events)
    }

    pub async fn run(
        mut self,
        events: mpsc::UnboundedSender<RemoteEvent>,
        every: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll().await {
                Ok(found) => {
                    for event in found {
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!(error = %err, "remote poll failed"),
            }
        }
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod tests;
