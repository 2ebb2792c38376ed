use std::path::PathBuf;

use magic_api_core::FileEntity;
use tracing::{info, warn};

use super::diff::{meta_differs, scripts_differ};
use super::engine::{EngineError, SyncContext};
use super::meta::MirrorFileMeta;
use super::paths::ResourceKey;
use super::planner::{Decision, SyncDirection, decide};
use super::remote::RemoteStore;

/// Decides what to do with one resource given both sides, without touching
/// either of them.
pub fn detect_and_propose_conflict(
    local_meta: Option<&MirrorFileMeta>,
    remote_meta: &MirrorFileMeta,
    local_script: &str,
    remote_script: &str,
) -> Decision {
    let scripts = scripts_differ(local_script, remote_script);
    let metas = local_meta.is_none_or(|local| meta_differs(local, remote_meta));
    decide(SyncDirection::Both, local_meta, remote_meta, scripts, metas)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
    Merged(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeProposal {
    pub script_path: PathBuf,
    pub meta_path: PathBuf,
}

impl<R: RemoteStore> SyncContext<R> {
    /// Writes the remote side into the merge scratch area. Neither the mirror
    /// copy nor the remote is modified.
    pub async fn propose_merge(
        &self,
        key: &ResourceKey,
        remote: &FileEntity,
    ) -> Result<MergeProposal, EngineError> {
        let remote_meta = MirrorFileMeta::from_remote(key, remote);
        let (script_path, meta_path) = self
            .store
            .write_merge_scratch(
                key,
                remote.script.as_deref().unwrap_or_default(),
                &remote_meta,
            )
            .await?;
        warn!(
            key = %key,
            remote_script = %script_path.display(),
            remote_meta = %meta_path.display(),
            "manual merge required"
        );
        Ok(MergeProposal {
            script_path,
            meta_path,
        })
    }

    /// Applies the user's merge choice and removes the scratch files.
    pub async fn resolve_merge(
        &self,
        key: &ResourceKey,
        resolution: Resolution,
    ) -> Result<MirrorFileMeta, EngineError> {
        let local_meta = self.store.read_meta(key).await?;
        let scratch_meta = self.store.read_merge_meta(key).await?;
        let remote_id = scratch_meta
            .as_ref()
            .and_then(|meta| meta.id.clone())
            .or_else(|| local_meta.as_ref().and_then(|meta| meta.id.clone()));

        let meta_for_push = || {
            let mut meta = local_meta
                .clone()
                .unwrap_or_else(|| MirrorFileMeta::for_new(key));
            if meta.id.is_none() {
                meta.id = remote_id.clone();
            }
            meta
        };
        let written = match resolution {
            Resolution::KeepLocal => {
                let script = self
                    .store
                    .read_script(key)
                    .await?
                    .ok_or_else(|| EngineError::MissingLocal(key.clone()))?;
                self.push_with(key, &script, meta_for_push()).await?
            }
            Resolution::TakeRemote => {
                let id = match remote_id.clone() {
                    Some(id) => id,
                    None => self
                        .cache
                        .resolve_file_id(key)
                        .await?
                        .ok_or_else(|| EngineError::MissingRemote(key.to_string()))?,
                };
                self.pull(key, &id).await?
            }
            Resolution::Merged(script) => {
                self.store.write_script(key, &script).await?;
                self.push_with(key, &script, meta_for_push()).await?
            }
        };
        self.store.clear_merge_scratch(key).await?;
        info!(key = %key, "merge resolved");
        Ok(written)
    }
}
