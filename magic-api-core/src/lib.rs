mod auth;
mod client;
mod models;

pub use auth::{Credentials, LoginClient};
pub use client::{ErrorClass, MagicApiClient, MagicApiError};
pub use models::{
    FileEntity, GroupEntity, ResourceNode, ResourceTree, WorkbenchData, parse_resource_tree,
};
