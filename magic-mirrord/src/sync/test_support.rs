use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use magic_api_core::{
    FileEntity, GroupEntity, MagicApiError, ResourceNode, ResourceTree, WorkbenchData,
};

use super::remote::RemoteStore;
use super::store::now_millis;

pub(crate) const ROOT_ID: &str = "0";

#[derive(Default)]
struct State {
    types: Vec<String>,
    groups: HashMap<String, GroupEntity>,
    files: HashMap<String, (String, FileEntity)>,
    next_id: u64,
    clock: i64,
    offline: bool,
    created_groups: Vec<String>,
    saved_files: Vec<String>,
}

impl State {
    fn tick(&mut self) -> i64 {
        self.clock = (self.clock + 1).max(now_millis());
        self.clock
    }

    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn group_path(&self, kind: &str, id: &str) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = id.to_string();
        while current != ROOT_ID {
            let group = self.groups.get(&current).filter(|group| group.kind == kind)?;
            segments.push(group.name.clone());
            current = group.parent_id.clone().unwrap_or_else(|| ROOT_ID.into());
        }
        segments.push(kind.to_string());
        segments.reverse();
        Some(segments.join("/"))
    }

    fn children(&self, kind: &str, parent: &str) -> Vec<ResourceNode> {
        let mut groups: Vec<&GroupEntity> = self
            .groups
            .values()
            .filter(|group| {
                group.kind == kind && group.parent_id.as_deref().unwrap_or(ROOT_ID) == parent
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        let mut files: Vec<&FileEntity> = self
            .files
            .values()
            .filter(|(file_kind, file)| {
                file_kind == kind && file.group_id.as_deref() == Some(parent)
            })
            .map(|(_, file)| file)
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let mut nodes = Vec::new();
        for group in groups {
            let id = group.id.clone().unwrap_or_default();
            nodes.push(ResourceNode::Group {
                children: self.children(kind, &id),
                id,
                name: group.name.clone(),
                parent_id: Some(parent.to_string()),
            });
        }
        for file in files {
            nodes.push(ResourceNode::File {
                id: file.id.clone().unwrap_or_default(),
                name: file.name.clone(),
                group_id: parent.to_string(),
                update_time: file.update_time,
            });
        }
        nodes
    }

    fn check_online(&self) -> Result<(), MagicApiError> {
        if self.offline {
            return Err(MagicApiError::Api {
                code: 503,
                message: "server offline".into(),
            });
        }
        Ok(())
    }
}

fn not_found(what: &str, id: &str) -> MagicApiError {
    MagicApiError::Api {
        code: 0,
        message: format!("{what} {id} not found"),
    }
}

/// In-memory remote keyed like the real server: every type shares root id `0`
/// and saves are stamped with the wall clock.
pub(crate) struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub(crate) fn new(types: &[String]) -> Self {
        Self {
            state: Mutex::new(State {
                types: types.to_vec(),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn root_id(&self, _kind: &str) -> String {
        ROOT_ID.to_string()
    }

    /// `parent` empty means the type root.
    pub(crate) fn add_group(&self, kind: &str, parent: &str, name: &str) -> String {
        let mut state = self.state();
        let id = state.allocate("g");
        let parent = if parent.is_empty() { ROOT_ID } else { parent };
        state.groups.insert(
            id.clone(),
            GroupEntity {
                id: Some(id.clone()),
                name: name.into(),
                kind: kind.into(),
                parent_id: Some(parent.into()),
                ..Default::default()
            },
        );
        id
    }

    pub(crate) fn add_file(
        &self,
        kind: &str,
        group_id: &str,
        name: &str,
        script: &str,
        update_time: i64,
    ) -> String {
        let mut state = self.state();
        let id = state.allocate("f");
        let method = (kind == "api").then(|| "GET".to_string());
        let path = (kind == "api").then(|| name.to_string());
        state.files.insert(
            id.clone(),
            (
                kind.into(),
                FileEntity {
                    id: Some(id.clone()),
                    name: name.into(),
                    group_id: Some(group_id.into()),
                    script: Some(script.into()),
                    method,
                    path,
                    create_time: Some(update_time),
                    update_time: Some(update_time),
                    ..Default::default()
                },
            ),
        );
        id
    }

    /// Simulates an edit made on the server.
    pub(crate) fn edit_file(&self, id: &str, script: &str, update_time: i64) {
        let mut state = self.state();
        if let Some((_, file)) = state.files.get_mut(id) {
            file.script = Some(script.into());
            file.update_time = Some(update_time);
        }
    }

    pub(crate) fn file(&self, id: &str) -> Option<FileEntity> {
        self.state().files.get(id).map(|(_, file)| file.clone())
    }

    pub(crate) fn file_at(&self, kind: &str, group_sub: &str, name: &str) -> Option<FileEntity> {
        let group_id = self.group_id(kind, group_sub)?;
        self.state()
            .files
            .values()
            .find(|(file_kind, file)| {
                file_kind == kind
                    && file.name == name
                    && file.group_id.as_deref() == Some(group_id.as_str())
            })
            .map(|(_, file)| file.clone())
    }

    /// `group_sub` empty resolves to the type root.
    pub(crate) fn group_id(&self, kind: &str, group_sub: &str) -> Option<String> {
        let state = self.state();
        let mut current = ROOT_ID.to_string();
        for segment in group_sub.split('/').filter(|segment| !segment.is_empty()) {
            let (id, _) = state.groups.iter().find(|(_, group)| {
                group.kind == kind
                    && group.name == segment
                    && group.parent_id.as_deref() == Some(current.as_str())
            })?;
            current = id.clone();
        }
        Some(current)
    }

    pub(crate) fn created_groups(&self) -> Vec<String> {
        self.state().created_groups.clone()
    }

    pub(crate) fn saved_files(&self) -> Vec<String> {
        self.state().saved_files.clone()
    }

    pub(crate) fn file_count(&self) -> usize {
        self.state().files.len()
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }
}

impl RemoteStore for MemoryRemote {
    async fn fetch_tree(&self) -> Result<ResourceTree, MagicApiError> {
        let state = self.state();
        state.check_online()?;
        let mut tree = ResourceTree::default();
        for kind in &state.types {
            tree.roots.insert(
                kind.clone(),
                ResourceNode::Group {
                    id: ROOT_ID.into(),
                    name: kind.clone(),
                    parent_id: None,
                    children: state.children(kind, ROOT_ID),
                },
            );
        }
        Ok(tree)
    }

    async fn get_file(&self, id: &str) -> Result<FileEntity, MagicApiError> {
        let state = self.state();
        state.check_online()?;
        state
            .files
            .get(id)
            .map(|(_, file)| file.clone())
            .ok_or_else(|| not_found("file", id))
    }

    async fn save_file(&self, kind: &str, file: &FileEntity) -> Result<String, MagicApiError> {
        let mut state = self.state();
        state.check_online()?;
        let group_id = file.group_id.clone().unwrap_or_else(|| ROOT_ID.into());
        let group_path = state
            .group_path(kind, &group_id)
            .ok_or_else(|| not_found("group", &group_id))?;
        let now = state.tick();
        let mut saved = file.clone();
        saved.group_id = Some(group_id);
        saved.update_time = Some(now);
        let id = match &file.id {
            Some(id) => {
                let (_, existing) = state.files.get(id).ok_or_else(|| not_found("file", id))?;
                saved.create_time = existing.create_time;
                id.clone()
            }
            None => {
                saved.create_time = Some(now);
                state.allocate("f")
            }
        };
        saved.id = Some(id.clone());
        state
            .saved_files
            .push(format!("{group_path}/{}", saved.name));
        state.files.insert(id.clone(), (kind.to_string(), saved));
        Ok(id)
    }

    async fn delete_file(&self, id: &str) -> Result<(), MagicApiError> {
        let mut state = self.state();
        state.check_online()?;
        state
            .files
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found("file", id))
    }

    async fn get_group(&self, id: &str) -> Result<GroupEntity, MagicApiError> {
        let state = self.state();
        state.check_online()?;
        state
            .groups
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("group", id))
    }

    async fn save_group(&self, group: &GroupEntity) -> Result<String, MagicApiError> {
        let mut state = self.state();
        state.check_online()?;
        let parent = group.parent_id.clone().unwrap_or_else(|| ROOT_ID.into());
        let parent_path = state
            .group_path(&group.kind, &parent)
            .ok_or_else(|| not_found("group", &parent))?;
        let id = match &group.id {
            Some(id) if state.groups.contains_key(id) => id.clone(),
            Some(id) => return Err(not_found("group", id)),
            None => {
                let id = state.allocate("g");
                state
                    .created_groups
                    .push(format!("{parent_path}/{}", group.name));
                id
            }
        };
        let mut saved = group.clone();
        saved.id = Some(id.clone());
        saved.parent_id = Some(parent);
        state.groups.insert(id.clone(), saved);
        Ok(id)
    }

    async fn delete_group(&self, id: &str) -> Result<(), MagicApiError> {
        let mut state = self.state();
        state.check_online()?;
        if state.groups.remove(id).is_none() {
            return Err(not_found("group", id));
        }
        let mut orphans = vec![id.to_string()];
        while let Some(parent) = orphans.pop() {
            let child_groups: Vec<String> = state
                .groups
                .iter()
                .filter(|(_, group)| group.parent_id.as_deref() == Some(parent.as_str()))
                .map(|(id, _)| id.clone())
                .collect();
            for child in child_groups {
                state.groups.remove(&child);
                orphans.push(child);
            }
            state
                .files
                .retain(|_, (_, file)| file.group_id.as_deref() != Some(parent.as_str()));
        }
        Ok(())
    }

    async fn fetch_workbench(&self) -> Result<WorkbenchData, MagicApiError> {
        self.state().check_online()?;
        Ok(WorkbenchData {
            classes: vec!["java.util.List".into()],
            extensions: vec!["java.lang.String".into()],
            functions: vec!["now".into()],
        })
    }
}
