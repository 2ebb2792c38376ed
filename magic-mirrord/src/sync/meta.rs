use magic_api_core::{Credentials, FileEntity, WorkbenchData};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::paths::ResourceKey;

pub const API_KIND: &str = "api";
pub const TASK_KIND: &str = "task";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("{kind} resource {name} requires field `{field}`")]
    MissingField {
        kind: String,
        name: String,
        field: &'static str,
    },
    #[error("groupPath {group_path} does not start with type {kind}")]
    GroupPathMismatch { kind: String, group_path: String },
    #[error("sidecar must be a JSON object")]
    NotAnObject,
}

/// Per-resource sidecar stored next to the script as `.<name>.meta.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorFileMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub group_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_on_start: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_update_time: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MirrorFileMeta {
    /// Sidecar for a resource that has never been created remotely.
    pub fn for_new(key: &ResourceKey) -> Self {
        let mut meta = Self {
            name: key.name.clone(),
            kind: key.kind.clone(),
            group_path: key.group_path(),
            ..Default::default()
        };
        if key.kind == API_KIND {
            meta.method = Some("GET".into());
            meta.path = Some(key.name.clone());
        }
        meta
    }

    pub fn from_remote(key: &ResourceKey, file: &FileEntity) -> Self {
        Self {
            id: file.id.clone(),
            name: key.name.clone(),
            kind: key.kind.clone(),
            group_id: file.group_id.clone(),
            group_path: key.group_path(),
            path: file.path.clone(),
            method: file.method.clone(),
            description: file.description.clone(),
            locked: file.locked,
            params: file.params.clone(),
            headers: file.headers.clone(),
            content_type: file.content_type.clone(),
            timeout: file.timeout,
            cron: file.cron.clone(),
            enabled: file.enabled,
            execute_on_start: file.execute_on_start,
            create_time: file.create_time,
            update_time: file.update_time,
            local_update_time: None,
            extra: file.extra.clone(),
        }
    }

    pub fn to_entity(&self, script: Option<String>) -> FileEntity {
        FileEntity {
            id: self.id.clone(),
            name: self.name.clone(),
            group_id: self.group_id.clone(),
            script,
            path: self.path.clone(),
            method: self.method.clone(),
            description: self.description.clone(),
            locked: self.locked,
            params: self.params.clone(),
            headers: self.headers.clone(),
            content_type: self.content_type.clone(),
            timeout: self.timeout,
            cron: self.cron.clone(),
            enabled: self.enabled,
            execute_on_start: self.execute_on_start,
            create_time: self.create_time,
            update_time: self.update_time,
            extra: self.extra.clone(),
        }
    }

    /// Projection used for content comparison: local bookkeeping removed.
    pub fn sanitized(&self) -> Self {
        Self {
            local_update_time: None,
            ..self.clone()
        }
    }

    /// Re-asserts the fields derived from the file location.
    pub fn pin_to(&mut self, key: &ResourceKey) {
        self.name = key.name.clone();
        self.kind = key.kind.clone();
        self.group_path = key.group_path();
    }

    pub fn validate(&self) -> Result<(), MetaError> {
        if self.name.trim().is_empty() {
            return Err(self.missing("name"));
        }
        if self.group_path != self.kind
            && !self.group_path.starts_with(&format!("{}/", self.kind))
        {
            return Err(MetaError::GroupPathMismatch {
                kind: self.kind.clone(),
                group_path: self.group_path.clone(),
            });
        }
        match self.kind.as_str() {
            API_KIND => {
                if is_blank(self.method.as_deref()) {
                    return Err(self.missing("method"));
                }
                if is_blank(self.path.as_deref()) {
                    return Err(self.missing("path"));
                }
            }
            TASK_KIND => {
                if is_blank(self.cron.as_deref()) {
                    return Err(self.missing("cron"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Overlays the fields of `edited` on top of `self`; keys absent from
    /// `edited` keep their current values.
    pub fn merged_with(&self, edited: Value) -> Result<Value, MetaError> {
        let Value::Object(edited) = edited else {
            return Err(MetaError::NotAnObject);
        };
        let mut base = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (field, value) in edited {
            base.insert(field, value);
        }
        Ok(Value::Object(base))
    }

    fn missing(&self, field: &'static str) -> MetaError {
        MetaError::MissingField {
            kind: self.kind.clone(),
            name: self.name.clone(),
            field,
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|value| value.trim().is_empty())
}

/// Connection settings and cached editor data stored once per mirror root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRootMeta {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<WorkbenchData>,
}

impl MirrorRootMeta {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}
