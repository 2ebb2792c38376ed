use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::MagicApiError;

/// One node of a remote resource tree, classified once at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceNode {
    Group {
        id: String,
        name: String,
        parent_id: Option<String>,
        children: Vec<ResourceNode>,
    },
    File {
        id: String,
        name: String,
        group_id: String,
        update_time: Option<i64>,
    },
}

impl ResourceNode {
    pub fn id(&self) -> &str {
        match self {
            ResourceNode::Group { id, .. } | ResourceNode::File { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ResourceNode::Group { name, .. } | ResourceNode::File { name, .. } => name,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ResourceNode::Group { .. })
    }
}

/// Per-type rooted trees as returned by the resource endpoint, keyed by type name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTree {
    pub roots: BTreeMap<String, ResourceNode>,
}

#[derive(Debug, Deserialize)]
struct RawTreeNode {
    #[serde(default)]
    node: Map<String, Value>,
    #[serde(default)]
    children: Vec<RawTreeNode>,
}

pub fn parse_resource_tree(data: Value) -> Result<ResourceTree, MagicApiError> {
    let Value::Object(types) = data else {
        return Err(MagicApiError::MalformedTree(
            "resource tree payload is not an object".into(),
        ));
    };
    let mut roots = BTreeMap::new();
    for (kind, raw) in types {
        let raw: RawTreeNode = serde_json::from_value(raw)
            .map_err(|err| MagicApiError::MalformedTree(format!("{kind}: {err}")))?;
        let root =
            classify(raw).map_err(|err| MagicApiError::MalformedTree(format!("{kind}: {err}")))?;
        if !root.is_group() {
            return Err(MagicApiError::MalformedTree(format!(
                "{kind}: root node is not a group"
            )));
        }
        roots.insert(kind, root);
    }
    Ok(ResourceTree { roots })
}

fn classify(raw: RawTreeNode) -> Result<ResourceNode, String> {
    let id = string_field(&raw.node, "id").ok_or("node without id")?;
    let name = string_field(&raw.node, "name").unwrap_or_default();
    if let Some(group_id) = string_field(&raw.node, "groupId") {
        return Ok(ResourceNode::File {
            id,
            name,
            group_id,
            update_time: raw.node.get("updateTime").and_then(Value::as_i64),
        });
    }
    let children = raw
        .children
        .into_iter()
        .map(classify)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ResourceNode::Group {
        id,
        name,
        parent_id: string_field(&raw.node, "parentId"),
        children,
    })
}

// Ids arrive either as strings or as numbers depending on the server storage.
fn string_field(node: &Map<String, Value>, key: &str) -> Option<String> {
    match node.get(key)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
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
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEntity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Names offered by the remote workbench for editor completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkbenchData {
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub functions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_groups_and_files_into_tagged_nodes() {
        let tree = parse_resource_tree(json!({
            "api": {
                "node": { "id": "0", "name": "api", "parentId": null },
                "children": [
                    {
                        "node": { "id": "g1", "name": "user", "parentId": "0" },
                        "children": [
                            {
                                "node": {
                                    "id": "f1",
                                    "name": "login",
                                    "groupId": "g1",
                                    "updateTime": 1700
                                },
                                "children": []
                            }
                        ]
                    }
                ]
            }
        }))
        .unwrap();

        let root = tree.roots.get("api").unwrap();
        let ResourceNode::Group { children, .. } = root else {
            panic!("root must be a group");
        };
        let ResourceNode::Group { id, children, .. } = &children[0] else {
            panic!("user must be a group");
        };
        assert_eq!(id, "g1");
        assert_eq!(
            children[0],
            ResourceNode::File {
                id: "f1".into(),
                name: "login".into(),
                group_id: "g1".into(),
                update_time: Some(1700),
            }
        );
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let tree = parse_resource_tree(json!({
            "function": { "node": { "id": 7, "name": "function" }, "children": [] }
        }))
        .unwrap();
        assert_eq!(tree.roots.get("function").unwrap().id(), "7");
    }

    #[test]
    fn rejects_non_object_payload() {
        assert!(matches!(
            parse_resource_tree(json!([1, 2])),
            Err(MagicApiError::MalformedTree(_))
        ));
    }

    #[test]
    fn file_entity_keeps_unknown_fields() {
        let file: FileEntity = serde_json::from_value(json!({
            "id": "f1",
            "name": "login",
            "groupId": "g1",
            "method": "POST",
            "updateTime": 100,
            "requestBody": "{}"
        }))
        .unwrap();
        assert_eq!(file.update_time, Some(100));
        assert_eq!(file.extra.get("requestBody"), Some(&json!("{}")));
        let back = serde_json::to_value(&file).unwrap();
        assert_eq!(back["requestBody"], json!("{}"));
        assert!(back.get("script").is_none());
    }
}
