use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub const SCRIPT_EXT: &str = ".ms";
pub const META_SUFFIX: &str = ".meta.json";
pub const GROUP_META_FILE: &str = ".group.meta.json";
pub const ROOT_META_FILE: &str = ".magic-api-mirror.json";
pub const MERGE_DIR: &str = ".merge";
pub const MERGE_META_DIR: &str = ".merge-meta";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("mirror path is empty")]
    Empty,
    #[error("mirror path contains unsupported component")]
    UnsupportedComponent,
}

/// Identity of one script resource: `(type, group path below the type, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: String,
    pub group_sub: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, group_sub: &str, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            group_sub: group_sub.trim_matches('/').to_string(),
            name: name.into(),
        }
    }

    /// `api/user` for `api/user/login`; always starts with the type.
    pub fn group_path(&self) -> String {
        join_group_path(&self.kind, &self.group_sub)
    }

    /// Path of the script relative to the mirror root, e.g. `api/user/login.ms`.
    pub fn file_path(&self) -> String {
        format!("{}/{}{SCRIPT_EXT}", self.group_path(), self.name)
    }

    pub fn group_segments(&self) -> impl Iterator<Item = &str> {
        self.group_sub.split('/').filter(|segment| !segment.is_empty())
    }

    pub fn parse_file_path(path: &str) -> Option<Self> {
        let stem = path.strip_suffix(SCRIPT_EXT)?;
        let (dir, name) = stem.rsplit_once('/')?;
        let (kind, group_sub) = dir.split_once('/').unwrap_or((dir, ""));
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(kind, group_sub, name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_path(), self.name)
    }
}

pub fn join_group_path(kind: &str, group_sub: &str) -> String {
    let group_sub = group_sub.trim_matches('/');
    if group_sub.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}/{group_sub}")
    }
}

pub fn mirror_path_for(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// What a path inside the mirror refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
    Script(ResourceKey),
    Meta(ResourceKey),
    Group { kind: String, group_sub: String },
}

/// Classifies `path` by the first segment naming a known resource type, so the
/// mirror root may live at any depth. Scratch and hidden directories are skipped.
pub fn locate_target(root: &Path, path: &Path, types: &[String]) -> Option<PathTarget> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let segments: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if segments
        .first()
        .is_some_and(|first| first == MERGE_DIR || first == MERGE_META_DIR)
    {
        return None;
    }

    let type_index = segments
        .iter()
        .position(|segment| types.iter().any(|kind| kind == segment))?;
    let kind = segments[type_index].clone();
    let rest = &segments[type_index + 1..];
    let (last, dirs) = rest.split_last()?;
    if dirs.iter().any(|segment| segment.starts_with('.')) {
        return None;
    }
    let group_sub = dirs.join("/");

    if last == GROUP_META_FILE {
        return None;
    }
    if let Some(name) = last
        .strip_prefix('.')
        .and_then(|hidden| hidden.strip_suffix(META_SUFFIX))
    {
        if name.is_empty() {
            return None;
        }
        return Some(PathTarget::Meta(ResourceKey::new(kind, &group_sub, name)));
    }
    if let Some(name) = last.strip_suffix(SCRIPT_EXT) {
        if name.is_empty() || name.starts_with('.') {
            return None;
        }
        return Some(PathTarget::Script(ResourceKey::new(kind, &group_sub, name)));
    }
    if !last.contains('.') {
        return Some(PathTarget::Group {
            kind,
            group_sub: rest.join("/"),
        });
    }
    None
}
