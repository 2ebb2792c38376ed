use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use magic_api_core::{MagicApiError, ResourceNode, ResourceTree};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use super::paths::{ResourceKey, join_group_path};
use super::remote::RemoteStore;

#[derive(Debug, Error)]
pub enum CacheError {
    /// State is unknown, not absent.
    #[error("remote unavailable: {0}")]
    Remote(#[from] MagicApiError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSummary {
    pub id: String,
    pub name: String,
    pub key: ResourceKey,
    pub group_id: String,
    pub update_time: Option<i64>,
}

/// Two maps kept as mutual inverses.
#[derive(Debug, Clone, Default)]
pub struct PathIdMap {
    path_to_id: HashMap<String, String>,
    id_to_path: HashMap<String, String>,
}

impl PathIdMap {
    pub fn insert(&mut self, path: String, id: String) {
        if let Some(old_id) = self.path_to_id.remove(&path) {
            self.id_to_path.remove(&old_id);
        }
        if let Some(old_path) = self.id_to_path.remove(&id) {
            self.path_to_id.remove(&old_path);
        }
        self.path_to_id.insert(path.clone(), id.clone());
        self.id_to_path.insert(id, path);
    }

    pub fn id_of(&self, path: &str) -> Option<&str> {
        self.path_to_id.get(path).map(String::as_str)
    }

    pub fn path_of(&self, id: &str) -> Option<&str> {
        self.id_to_path.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.path_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path_to_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.path_to_id
            .iter()
            .map(|(path, id)| (path.as_str(), id.as_str()))
    }
}

/// Flattened view of one tree fetch. Type roots are kept apart from the id
/// maps because every type may use the same root id.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    pub directories: Vec<String>,
    pub roots: HashMap<String, String>,
    pub groups: PathIdMap,
    pub files: PathIdMap,
    pub files_by_dir: BTreeMap<String, Vec<ResourceSummary>>,
}

impl TreeSnapshot {
    pub fn group_id(&self, kind: &str, group_sub: &str) -> Option<&str> {
        if group_sub.trim_matches('/').is_empty() {
            return self.roots.get(kind).map(String::as_str);
        }
        self.groups.id_of(&join_group_path(kind, group_sub))
    }

    pub fn file_id(&self, key: &ResourceKey) -> Option<&str> {
        self.files.id_of(&key.file_path())
    }
}

pub fn flatten_tree(tree: &ResourceTree, types: &[String]) -> TreeSnapshot {
    let mut snapshot = TreeSnapshot::default();
    for kind in types {
        let Some(root) = tree.roots.get(kind) else {
            continue;
        };
        snapshot.roots.insert(kind.clone(), root.id().to_string());
        snapshot.directories.push(kind.clone());

        let mut queue = VecDeque::new();
        queue.push_back((root, String::new()));
        while let Some((node, group_sub)) = queue.pop_front() {
            let ResourceNode::Group { id, children, .. } = node else {
                continue;
            };
            for child in children {
                match child {
                    ResourceNode::Group { id: child_id, name, .. } => {
                        let sub = if group_sub.is_empty() {
                            name.clone()
                        } else {
                            format!("{group_sub}/{name}")
                        };
                        let dir = join_group_path(kind, &sub);
                        snapshot.directories.push(dir.clone());
                        snapshot.groups.insert(dir, child_id.clone());
                        queue.push_back((child, sub));
                    }
                    ResourceNode::File {
                        id: file_id,
                        name,
                        group_id,
                        update_time,
                    } => {
                        let key = ResourceKey::new(kind.as_str(), &group_sub, name.as_str());
                        snapshot.files.insert(key.file_path(), file_id.clone());
                        snapshot
                            .files_by_dir
                            .entry(key.group_path())
                            .or_default()
                            .push(ResourceSummary {
                                id: file_id.clone(),
                                name: name.clone(),
                                key,
                                group_id: if group_id.is_empty() {
                                    id.clone()
                                } else {
                                    group_id.clone()
                                },
                                update_time: *update_time,
                            });
                    }
                }
            }
        }
    }
    snapshot
}

/// Path/id cache over the remote tree. The snapshot is replaced whole after
/// each fetch and never patched in place.
pub struct TreeCache<R> {
    remote: Arc<R>,
    types: Vec<String>,
    snapshot: RwLock<Arc<TreeSnapshot>>,
}

impl<R: RemoteStore> TreeCache<R> {
    pub fn new(remote: Arc<R>, types: Vec<String>) -> Self {
        Self {
            remote,
            types,
            snapshot: RwLock::new(Arc::new(TreeSnapshot::default())),
        }
    }

    pub async fn refresh(&self) -> Result<Arc<TreeSnapshot>, CacheError> {
        let tree = self.remote.fetch_tree().await?;
        let snapshot = Arc::new(flatten_tree(&tree, &self.types));
        debug!(
            directories = snapshot.directories.len(),
            files = snapshot.files.len(),
            "resource tree refreshed"
        );
        *self.snapshot.write().await = Arc::clone(&snapshot);
        Ok(snapshot)
    }

    pub async fn snapshot(&self) -> Arc<TreeSnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn fetch_directories(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.refresh().await?.directories.clone())
    }

    pub async fn fetch_files_in(&self, dir: &str) -> Result<Vec<ResourceSummary>, CacheError> {
        let dir = dir.trim_matches('/');
        let lookup = |snapshot: &TreeSnapshot| {
            snapshot
                .directories
                .iter()
                .any(|known| known == dir)
                .then(|| snapshot.files_by_dir.get(dir).cloned().unwrap_or_default())
        };
        if let Some(files) = lookup(&*self.snapshot().await) {
            return Ok(files);
        }
        Ok(lookup(&*self.refresh().await?).unwrap_or_default())
    }

    pub async fn resolve_group_id(
        &self,
        kind: &str,
        group_sub: &str,
    ) -> Result<Option<String>, CacheError> {
        self.lookup_with_refresh(|snapshot| snapshot.group_id(kind, group_sub).map(str::to_string))
            .await
    }

    pub async fn resolve_file_id(&self, key: &ResourceKey) -> Result<Option<String>, CacheError> {
        self.lookup_with_refresh(|snapshot| snapshot.file_id(key).map(str::to_string))
            .await
    }

    /// Resolves a group path (`api/user`) or a script path (`api/user/login.ms`).
    pub async fn resolve_id(&self, path: &str) -> Result<Option<String>, CacheError> {
        let path = path.trim_matches('/');
        match ResourceKey::parse_file_path(path) {
            Some(key) => self.resolve_file_id(&key).await,
            None => {
                let (kind, sub) = path.split_once('/').unwrap_or((path, ""));
                self.resolve_group_id(kind, sub).await
            }
        }
    }

    pub async fn resolve_path(&self, id: &str) -> Result<Option<String>, CacheError> {
        self.lookup_with_refresh(|snapshot| {
            snapshot
                .files
                .path_of(id)
                .or_else(|| snapshot.groups.path_of(id))
                .map(str::to_string)
        })
        .await
    }

    pub async fn file_exists(&self, id: &str) -> Result<bool, CacheError> {
        Ok(self
            .lookup_with_refresh(|snapshot| snapshot.files.path_of(id).map(|_| ()))
            .await?
            .is_some())
    }

    async fn lookup_with_refresh<T>(
        &self,
        lookup: impl Fn(&TreeSnapshot) -> Option<T>,
    ) -> Result<Option<T>, CacheError> {
        if let Some(found) = lookup(&*self.snapshot().await) {
            return Ok(Some(found));
        }
        Ok(lookup(&*self.refresh().await?))
    }
}
