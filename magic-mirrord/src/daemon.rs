use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use magic_api_core::{LoginClient, MagicApiClient};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::session::SessionProvider;
use crate::sync::conflict::Resolution;
use crate::sync::engine::SyncContext;
use crate::sync::local_watcher::{MirrorEvent, start_notify_watcher};
use crate::sync::meta::MirrorRootMeta;
use crate::sync::paths::{PathTarget, ResourceKey, locate_target};
use crate::sync::planner::{SyncDirection, SyncPlan, SyncReport};
use crate::sync::remote::SessionRemote;
use crate::sync::store::MirrorStore;
use crate::sync::watcher::{ChangeWatcher, RemotePoller};

const DEFAULT_MIRROR_DIR_NAME: &str = "magic-api-mirror";
const DEFAULT_RESOURCE_TYPES: &str = "api,function,task";
const DEFAULT_REMOTE_POLL_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub mirror_root: PathBuf,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    /// Reconciliation run before watching; `None` skips it.
    pub initial_sync: Option<SyncDirection>,
    pub enable_local_watcher: bool,
    /// Pause between remote change polls in watch mode; `None` disables them.
    pub remote_poll_interval: Option<Duration>,
    pub resource_types: Vec<String>,
}

impl MirrorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let mirror_root = std::env::var("MAGIC_MIRROR_ROOT")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_MIRROR_DIR_NAME));
        let initial_sync = match read_string_env("MAGIC_SYNC_DIRECTION") {
            Some(value) => SyncDirection::parse_choice(&value)
                .map_err(anyhow::Error::msg)
                .context("invalid MAGIC_SYNC_DIRECTION")?,
            None => Some(SyncDirection::Both),
        };
        let resource_types = parse_resource_types(
            &read_string_env("MAGIC_RESOURCE_TYPES")
                .unwrap_or_else(|| DEFAULT_RESOURCE_TYPES.to_string()),
        );
        if resource_types.is_empty() {
            anyhow::bail!("MAGIC_RESOURCE_TYPES names no resource type");
        }
        let remote_poll_interval = parse_poll_interval(
            read_string_env("MAGIC_REMOTE_POLL_SECS").as_deref(),
            DEFAULT_REMOTE_POLL_SECS,
        )
        .context("invalid MAGIC_REMOTE_POLL_SECS")?;

        Ok(Self {
            mirror_root,
            url: read_string_env("MAGIC_API_URL"),
            username: read_string_env("MAGIC_API_USERNAME"),
            password: read_string_env("MAGIC_API_PASSWORD"),
            token: read_string_env("MAGIC_API_TOKEN"),
            initial_sync,
            enable_local_watcher: read_bool_env("MAGIC_ENABLE_LOCAL_WATCHER", true),
            remote_poll_interval,
            resource_types,
        })
    }

    /// Connection settings from the environment layered over what the mirror
    /// root already stores.
    pub fn merge_root_meta(
        &self,
        stored: Option<MirrorRootMeta>,
    ) -> anyhow::Result<MirrorRootMeta> {
        let mut meta = stored.unwrap_or_default();
        if let Some(url) = &self.url {
            meta.url = url.clone();
        }
        if meta.url.trim().is_empty() {
            anyhow::bail!(
                "MAGIC_API_URL is not set and {} stores no server url",
                self.mirror_root.display()
            );
        }
        if self.username.is_some() {
            meta.username = self.username.clone();
        }
        if self.password.is_some() {
            meta.password = self.password.clone();
        }
        if self.token.is_some() {
            meta.token = self.token.clone();
        }
        Ok(meta)
    }
}

pub struct MirrorDaemon {
    config: MirrorConfig,
    ctx: Arc<SyncContext<SessionRemote>>,
}

impl MirrorDaemon {
    pub async fn bootstrap(config: MirrorConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.mirror_root)
            .await
            .with_context(|| format!("failed to create mirror root at {:?}", config.mirror_root))?;

        let store = Arc::new(MirrorStore::new(&config.mirror_root));
        let stored = store
            .read_root_meta()
            .await
            .context("failed to read mirror root meta")?;
        let mut root_meta = config.merge_root_meta(stored)?;

        let client = MagicApiClient::new(&root_meta.url, root_meta.token.clone())
            .context("invalid magic-api url")?;
        let mut session = SessionProvider::new(
            root_meta.credentials(),
            LoginClient::new(client.base_url()),
            root_meta.token.clone(),
        );
        let client = if root_meta.token.is_none() && session.has_credentials() {
            let token = session
                .valid_token()
                .await
                .context("failed to log in to magic-api")?;
            root_meta.token = Some(token.clone());
            client.with_token(token)
        } else {
            client
        };
        store
            .write_root_meta(&root_meta)
            .await
            .context("failed to persist mirror root meta")?;

        let remote = SessionRemote::new(client, session).with_store(Arc::clone(&store));
        let ctx = Arc::new(SyncContext::new(
            Arc::new(remote),
            store,
            config.resource_types.clone(),
        ));
        Ok(Self { config, ctx })
    }

    pub async fn plan(&self, cancel: &CancellationToken) -> anyhow::Result<SyncPlan> {
        self.ctx
            .plan(cancel)
            .await
            .context("failed to compare mirror with remote")
    }

    pub async fn apply(
        &self,
        plan: SyncPlan,
        direction: SyncDirection,
        cancel: &CancellationToken,
    ) -> SyncReport {
        let report = self.ctx.apply(plan, direction, cancel).await;
        for (key, reason) in &report.failures {
            warn!(key = %key, reason = %reason, "resource not synced");
        }
        report
    }

    /// Dry run followed by apply in `direction`, then a completion cache refresh.
    pub async fn reconcile(
        &self,
        direction: SyncDirection,
        cancel: &CancellationToken,
    ) -> anyhow::Result<SyncReport> {
        let plan = self.plan(cancel).await?;
        info!(summary = %plan.summary(), direction = %direction, "reconciling");
        let report = self.apply(plan, direction, cancel).await;
        if let Err(err) = self.ctx.refresh_completion_cache().await {
            warn!(error = %err, "completion cache not refreshed");
        }
        Ok(report)
    }

    /// Applies a manual merge choice to the script at `path` and clears its
    /// scratch files.
    pub async fn resolve(
        &self,
        path: &Path,
        resolution: Resolution,
    ) -> anyhow::Result<ResourceKey> {
        let Some(PathTarget::Script(key)) =
            locate_target(&self.config.mirror_root, path, self.ctx.types())
        else {
            anyhow::bail!("{} is not a script in the mirror", path.display());
        };
        self.ctx
            .resolve_merge(&key, resolution)
            .await
            .with_context(|| format!("failed to resolve {key}"))?;
        Ok(key)
    }

    pub async fn run_watch(self) -> anyhow::Result<()> {
        info!(
            mirror_root = %self.config.mirror_root.display(),
            types = ?self.config.resource_types,
            local_watcher = self.config.enable_local_watcher,
            "mirror daemon started"
        );
        let cancel = CancellationToken::new();
        match self.config.initial_sync {
            Some(direction) => {
                let report = self.reconcile(direction, &cancel).await?;
                info!(
                    pushed = report.pushed.len(),
                    pulled = report.pulled.len(),
                    merges = report.merges.len(),
                    failures = report.failures.len(),
                    "initial reconciliation finished"
                );
            }
            None => info!("initial reconciliation skipped"),
        }

        let (watcher, local_rx): (
            Option<notify::RecommendedWatcher>,
            Option<mpsc::UnboundedReceiver<MirrorEvent>>,
        ) = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.mirror_root) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    warn!(error = %err, "failed to start local watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let change_watcher = Arc::new(ChangeWatcher::new(Arc::clone(&self.ctx)));
        let local_handle = local_rx.map(|rx| {
            let change_watcher = Arc::clone(&change_watcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { change_watcher.run_local(rx, cancel).await })
        });
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let remote_handle = {
            let change_watcher = Arc::clone(&change_watcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { change_watcher.run_remote(remote_rx, cancel).await })
        };
        let poll_handle = self.config.remote_poll_interval.map(|every| {
            let poller = RemotePoller::new(Arc::clone(&self.ctx));
            tokio::spawn(poller.run(remote_tx, every, cancel.clone()))
        });

        let _watcher = watcher;
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");
        cancel.cancel();

        if let Some(handle) = local_handle {
            let _ = handle.await;
        }
        if let Some(handle) = poll_handle {
            let _ = handle.await;
        }
        let _ = remote_handle.await;
        Ok(())
    }
}

/// Forgets the cached session token of the mirror at `mirror_root`.
pub async fn logout(mirror_root: &Path) -> anyhow::Result<bool> {
    let store = MirrorStore::new(mirror_root);
    let Some(mut meta) = store
        .read_root_meta()
        .await
        .context("failed to read mirror root meta")?
    else {
        return Ok(false);
    };
    if meta.token.take().is_none() {
        return Ok(false);
    }
    store
        .write_root_meta(&meta)
        .await
        .context("failed to persist mirror root meta")?;
    Ok(true)
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
