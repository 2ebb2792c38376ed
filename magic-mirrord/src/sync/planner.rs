use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use magic_api_core::FileEntity;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::diff::{meta_differs, scripts_differ};
use super::engine::{EngineError, SyncContext};
use super::meta::MirrorFileMeta;
use super::paths::ResourceKey;
use super::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Both,
    Push,
    Pull,
}

impl SyncDirection {
    pub fn includes_push(self) -> bool {
        matches!(self, SyncDirection::Both | SyncDirection::Push)
    }

    pub fn includes_pull(self) -> bool {
        matches!(self, SyncDirection::Both | SyncDirection::Pull)
    }

    /// Parses a direction where `skip` means "do not reconcile".
    pub fn parse_choice(value: &str) -> Result<Option<Self>, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" | "none" => Ok(None),
            other => other.parse().map(Some),
        }
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "both" | "bidirectional" => Ok(SyncDirection::Both),
            "push" | "upload" => Ok(SyncDirection::Push),
            "pull" | "download" => Ok(SyncDirection::Pull),
            other => Err(format!("unknown sync direction: {other}")),
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncDirection::Both => "both",
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Push,
    Pull,
    /// Equal clocks with differing content; never resolved automatically.
    Merge,
}

/// Per-resource choice for a key present on both sides.
pub fn decide(
    direction: SyncDirection,
    local_meta: Option<&MirrorFileMeta>,
    remote_meta: &MirrorFileMeta,
    scripts_differ: bool,
    meta_differs: bool,
) -> Decision {
    if !scripts_differ && !meta_differs {
        return Decision::Skip;
    }
    let lt = local_meta
        .and_then(|meta| meta.local_update_time)
        .unwrap_or(0);
    let rt = remote_meta.update_time.unwrap_or(0);
    match direction {
        SyncDirection::Both => match lt.cmp(&rt) {
            std::cmp::Ordering::Greater => Decision::Push,
            std::cmp::Ordering::Less => Decision::Pull,
            std::cmp::Ordering::Equal => Decision::Merge,
        },
        SyncDirection::Push if lt >= rt => Decision::Push,
        SyncDirection::Pull if rt >= lt => Decision::Pull,
        SyncDirection::Push | SyncDirection::Pull if scripts_differ => Decision::Merge,
        SyncDirection::Push | SyncDirection::Pull => Decision::Skip,
    }
}

#[derive(Debug, Clone)]
pub enum Presence {
    LocalOnly,
    RemoteOnly {
        id: String,
    },
    Changed {
        remote: FileEntity,
        local_meta: Option<MirrorFileMeta>,
        local_script: String,
        scripts_differ: bool,
        meta_differs: bool,
    },
}

#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub key: ResourceKey,
    pub presence: Presence,
}

impl PlanEntry {
    pub fn presence_label(&self) -> &'static str {
        match self.presence {
            Presence::LocalOnly => "local only",
            Presence::RemoteOnly { .. } => "remote only",
            Presence::Changed { .. } => "changed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub local_only: usize,
    pub remote_only: usize,
    pub changed: usize,
}

impl SyncSummary {
    pub fn is_empty(&self) -> bool {
        self.local_only == 0 && self.remote_only == 0 && self.changed == 0
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "local only: {}, remote only: {}, changed: {}",
            self.local_only, self.remote_only, self.changed
        )
    }
}

/// Result of the side-effect-free dry run.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub entries: Vec<PlanEntry>,
    pub unchanged: usize,
    pub failures: Vec<(ResourceKey, String)>,
}

impl SyncPlan {
    pub fn summary(&self) -> SyncSummary {
        let mut summary = SyncSummary::default();
        for entry in &self.entries {
            match entry.presence {
                Presence::LocalOnly => summary.local_only += 1,
                Presence::RemoteOnly { .. } => summary.remote_only += 1,
                Presence::Changed { .. } => summary.changed += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub pushed: Vec<ResourceKey>,
    pub pulled: Vec<ResourceKey>,
    pub merges: Vec<ResourceKey>,
    pub skipped: usize,
    pub failures: Vec<(ResourceKey, String)>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.merges.is_empty() && !self.cancelled
    }
}

impl<R: RemoteStore> SyncContext<R> {
    /// Compares every resource on either side without touching the mirror or
    /// the remote. Cancellation is checked per directory and per resource.
    pub async fn plan(&self, cancel: &CancellationToken) -> Result<SyncPlan, EngineError> {
        let snapshot = self.cache.refresh().await?;
        let local_keys = self.store.list_all_scripts(&self.types).await?;

        let mut plan = SyncPlan::default();
        for key in &local_keys {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let Some(id) = snapshot.file_id(key) else {
                plan.entries.push(PlanEntry {
                    key: key.clone(),
                    presence: Presence::LocalOnly,
                });
                continue;
            };
            match self.compare(key, id).await {
                Ok(Some(presence)) => plan.entries.push(PlanEntry {
                    key: key.clone(),
                    presence,
                }),
                Ok(None) => plan.unchanged += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "compare failed");
                    plan.failures.push((key.clone(), err.to_string()));
                }
            }
        }

        let local: BTreeSet<&ResourceKey> = local_keys.iter().collect();
        for (dir, files) in &snapshot.files_by_dir {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            debug!(dir = %dir, files = files.len(), "scanning remote directory");
            for summary in files {
                if local.contains(&summary.key) {
                    continue;
                }
                plan.entries.push(PlanEntry {
                    key: summary.key.clone(),
                    presence: Presence::RemoteOnly {
                        id: summary.id.clone(),
                    },
                });
            }
        }
        info!(summary = %plan.summary(), failures = plan.failures.len(), "dry run complete");
        Ok(plan)
    }

    async fn compare(&self, key: &ResourceKey, id: &str) -> Result<Option<Presence>, EngineError> {
        let local_meta = self.store.read_meta(key).await?;
        let local_script = self
            .store
            .read_script(key)
            .await?
            .ok_or_else(|| EngineError::MissingLocal(key.clone()))?;
        let remote = self.remote.get_file(id).await?;
        let remote_meta = MirrorFileMeta::from_remote(key, &remote);
        let scripts = scripts_differ(&local_script, remote.script.as_deref().unwrap_or_default());
        let metas = match &local_meta {
            Some(local) => meta_differs(local, &remote_meta),
            None => true,
        };
        if !scripts && !metas {
            return Ok(None);
        }
        Ok(Some(Presence::Changed {
            remote,
            local_meta,
            local_script,
            scripts_differ: scripts,
            meta_differs: metas,
        }))
    }

    /// Executes a plan. Each resource is isolated: failures are collected in
    /// the report and the batch continues.
    pub async fn apply(
        &self,
        plan: SyncPlan,
        direction: SyncDirection,
        cancel: &CancellationToken,
    ) -> SyncReport {
        let mut report = SyncReport {
            failures: plan.failures,
            skipped: plan.unchanged,
            ..Default::default()
        };
        for entry in plan.entries {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let key = entry.key;
            let outcome = match entry.presence {
                Presence::LocalOnly if direction.includes_push() => {
                    self.push(&key).await.map(|_| Decision::Push)
                }
                Presence::RemoteOnly { id } if direction.includes_pull() => {
                    self.pull(&key, &id).await.map(|_| Decision::Pull)
                }
                Presence::LocalOnly | Presence::RemoteOnly { .. } => Ok(Decision::Skip),
                Presence::Changed {
                    remote,
                    local_meta,
                    local_script,
                    scripts_differ,
                    meta_differs,
                } => {
                    let remote_meta = MirrorFileMeta::from_remote(&key, &remote);
                    let decision = decide(
                        direction,
                        local_meta.as_ref(),
                        &remote_meta,
                        scripts_differ,
                        meta_differs,
                    );
                    match decision {
                        Decision::Push => {
                            let meta =
                                local_meta.unwrap_or_else(|| MirrorFileMeta::for_new(&key));
                            self.push_with(&key, &local_script, meta)
                                .await
                                .map(|_| decision)
                        }
                        Decision::Pull => self.pull_entity(&key, &remote).await.map(|_| decision),
                        Decision::Merge => self
                            .propose_merge(&key, &remote)
                            .await
                            .map(|_| decision),
                        Decision::Skip => Ok(decision),
                    }
                }
            };
            match outcome {
                Ok(Decision::Push) => report.pushed.push(key),
                Ok(Decision::Pull) => report.pulled.push(key),
                Ok(Decision::Merge) => report.merges.push(key),
                Ok(Decision::Skip) => report.skipped += 1,
                Err(err) => {
                    warn!(key = %key, error = %err, "sync failed");
                    report.failures.push((key, err.to_string()));
                }
            }
        }
        info!(
            pushed = report.pushed.len(),
            pulled = report.pulled.len(),
            merges = report.merges.len(),
            failures = report.failures.len(),
            "reconciliation applied"
        );
        report
    }
}
