use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::meta::{MirrorFileMeta, MirrorRootMeta};
use super::paths::{
    GROUP_META_FILE, MERGE_DIR, MERGE_META_DIR, META_SUFFIX, PathError, ROOT_META_FILE, SCRIPT_EXT,
    ResourceKey, join_group_path, mirror_path_for,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed json in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

/// Who authored a sidecar write; only local edits advance `localUpdateTime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Local,
    Remote,
}

/// On-disk layout of a mirror root: scripts, sidecars, group snapshots, scratch files.
pub struct MirrorStore {
    root: PathBuf,
    echoes: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl MirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            echoes: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn script_path(&self, key: &ResourceKey) -> Result<PathBuf, StoreError> {
        Ok(mirror_path_for(&self.root, &key.file_path())?)
    }

    pub fn meta_path(&self, key: &ResourceKey) -> Result<PathBuf, StoreError> {
        let relative = format!("{}/.{}{META_SUFFIX}", key.group_path(), key.name);
        Ok(mirror_path_for(&self.root, &relative)?)
    }

    pub fn group_dir(&self, kind: &str, group_sub: &str) -> Result<PathBuf, StoreError> {
        Ok(mirror_path_for(&self.root, &join_group_path(kind, group_sub))?)
    }

    pub async fn read_script(&self, key: &ResourceKey) -> Result<Option<String>, StoreError> {
        let path = self.script_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub async fn write_script(&self, key: &ResourceKey, script: &str) -> Result<(), StoreError> {
        let path = self.script_path(key)?;
        self.write_bytes(&path, script.as_bytes()).await
    }

    /// Records `script` as the synced content of `key` without writing it.
    pub fn note_synced_script(&self, key: &ResourceKey, script: &str) -> Result<(), StoreError> {
        let path = self.script_path(key)?;
        self.remember(&path, script.as_bytes());
        Ok(())
    }

    pub async fn remove_script(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let path = self.script_path(key)?;
        self.forget(&path);
        remove_if_exists(&path).await
    }

    /// `Ok(None)` when no sidecar exists; `StoreError::Parse` when it is malformed.
    pub async fn read_meta(&self, key: &ResourceKey) -> Result<Option<MirrorFileMeta>, StoreError> {
        let path = self.meta_path(key)?;
        read_json(&path).await
    }

    /// The sole place `localUpdateTime` is stamped. Remote-origin writes keep
    /// whatever value `meta` carries.
    pub async fn write_meta(
        &self,
        key: &ResourceKey,
        meta: &MirrorFileMeta,
        origin: WriteOrigin,
    ) -> Result<MirrorFileMeta, StoreError> {
        let mut meta = meta.clone();
        meta.pin_to(key);
        if origin == WriteOrigin::Local {
            meta.local_update_time = Some(now_millis());
        }
        let path = self.meta_path(key)?;
        self.write_json(&path, &meta).await?;
        Ok(meta)
    }

    pub async fn remove_meta(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let path = self.meta_path(key)?;
        self.forget(&path);
        remove_if_exists(&path).await
    }

    pub async fn rename_meta(
        &self,
        from: &ResourceKey,
        to: &ResourceKey,
    ) -> Result<(), StoreError> {
        let source = self.meta_path(from)?;
        let target = self.meta_path(to)?;
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Ok(());
        }
        ensure_parent(&target).await?;
        self.forget(&source);
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|source| StoreError::Io {
                path: target.clone(),
                source,
            })
    }

    pub async fn read_group_meta(
        &self,
        kind: &str,
        group_sub: &str,
    ) -> Result<Option<Value>, StoreError> {
        let path = self.group_dir(kind, group_sub)?.join(GROUP_META_FILE);
        read_json(&path).await
    }

    pub async fn write_group_meta(
        &self,
        kind: &str,
        group_sub: &str,
        group: &Value,
    ) -> Result<(), StoreError> {
        let path = self.group_dir(kind, group_sub)?.join(GROUP_META_FILE);
        self.write_json(&path, group).await
    }

    /// Every script below each type root, in key order.
    pub async fn list_all_scripts(&self, types: &[String]) -> Result<Vec<ResourceKey>, StoreError> {
        let mut keys = Vec::new();
        for kind in types {
            let type_root = self.root.join(kind);
            let mut pending = vec![(type_root, String::new())];
            while let Some((dir, group_sub)) = pending.pop() {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(source) => return Err(StoreError::Io { path: dir, source }),
                };
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|source| StoreError::Io {
                        path: dir.clone(),
                        source,
                    })?
                {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') {
                        continue;
                    }
                    let file_type = entry.file_type().await.map_err(|source| StoreError::Io {
                        path: entry.path(),
                        source,
                    })?;
                    if file_type.is_dir() {
                        let child = if group_sub.is_empty() {
                            name
                        } else {
                            format!("{group_sub}/{name}")
                        };
                        pending.push((entry.path(), child));
                    } else if let Some(stem) = name.strip_suffix(SCRIPT_EXT)
                        && !stem.is_empty()
                    {
                        keys.push(ResourceKey::new(kind.as_str(), &group_sub, stem));
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Writes the remote side of a conflict next to the mirror for manual merging.
    pub async fn write_merge_scratch(
        &self,
        key: &ResourceKey,
        remote_script: &str,
        remote_meta: &MirrorFileMeta,
    ) -> Result<(PathBuf, PathBuf), StoreError> {
        let (script_path, meta_path) = self.merge_paths(key)?;
        self.write_bytes(&script_path, remote_script.as_bytes())
            .await?;
        self.write_json(&meta_path, remote_meta).await?;
        Ok((script_path, meta_path))
    }

    pub async fn read_merge_meta(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<MirrorFileMeta>, StoreError> {
        let (_, meta_path) = self.merge_paths(key)?;
        read_json(&meta_path).await
    }

    pub async fn clear_merge_scratch(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let (script_path, meta_path) = self.merge_paths(key)?;
        remove_if_exists(&script_path).await?;
        remove_if_exists(&meta_path).await
    }

    pub fn merge_paths(&self, key: &ResourceKey) -> Result<(PathBuf, PathBuf), StoreError> {
        let script = mirror_path_for(&self.root.join(MERGE_DIR), &key.file_path())?;
        let meta = mirror_path_for(
            &self.root.join(MERGE_META_DIR),
            &format!("{}/.{}{META_SUFFIX}", key.group_path(), key.name),
        )?;
        Ok((script, meta))
    }

    pub async fn read_root_meta(&self) -> Result<Option<MirrorRootMeta>, StoreError> {
        read_json(&self.root.join(ROOT_META_FILE)).await
    }

    pub async fn write_root_meta(&self, meta: &MirrorRootMeta) -> Result<(), StoreError> {
        let path = self.root.join(ROOT_META_FILE);
        self.write_json(&path, meta).await
    }

    /// True when `path` currently holds exactly the bytes this store last wrote there.
    pub async fn is_echo(&self, path: &Path) -> bool {
        let Some(expected) = self.last_written(path) else {
            return false;
        };
        match tokio::fs::read(path).await {
            Ok(current) => current == expected,
            Err(_) => false,
        }
    }

    pub fn last_written(&self, path: &Path) -> Option<Vec<u8>> {
        self.echoes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    fn remember(&self, path: &Path, bytes: &[u8]) {
        self.echoes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), bytes.to_vec());
    }

    fn forget(&self, path: &Path) {
        self.echoes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StoreError> {
        let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        bytes.push(b'\n');
        self.write_bytes(path, &bytes).await
    }

    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        ensure_parent(path).await?;
        self.remember(path, bytes);
        tokio::fs::write(path, bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), bytes = bytes.len(), "mirror file written");
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Wall clock in epoch milliseconds, the unit of `updateTime` on the server.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
