use std::future::Future;
use std::sync::Arc;

use magic_api_core::{
    FileEntity, GroupEntity, MagicApiClient, MagicApiError, ResourceTree, WorkbenchData,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::store::MirrorStore;
use crate::session::SessionProvider;

/// Remote operations the sync engine consumes.
pub trait RemoteStore: Send + Sync {
    fn fetch_tree(&self) -> impl Future<Output = Result<ResourceTree, MagicApiError>> + Send;

    fn get_file(&self, id: &str) -> impl Future<Output = Result<FileEntity, MagicApiError>> + Send;

    /// Creates when `file.id` is absent, updates otherwise. Returns the id.
    fn save_file(
        &self,
        kind: &str,
        file: &FileEntity,
    ) -> impl Future<Output = Result<String, MagicApiError>> + Send;

    fn delete_file(&self, id: &str) -> impl Future<Output = Result<(), MagicApiError>> + Send;

    fn get_group(&self, id: &str)
    -> impl Future<Output = Result<GroupEntity, MagicApiError>> + Send;

    fn save_group(
        &self,
        group: &GroupEntity,
    ) -> impl Future<Output = Result<String, MagicApiError>> + Send;

    fn delete_group(&self, id: &str) -> impl Future<Output = Result<(), MagicApiError>> + Send;

    fn fetch_workbench(&self)
    -> impl Future<Output = Result<WorkbenchData, MagicApiError>> + Send;
}

/// `MagicApiClient` with transparent re-login: an auth-class failure triggers
/// one credential login, the fresh token is persisted to the root meta, and
/// the call is replayed once.
pub struct SessionRemote {
    client: RwLock<MagicApiClient>,
    session: Mutex<SessionProvider>,
    store: Option<Arc<MirrorStore>>,
}

impl SessionRemote {
    pub fn new(client: MagicApiClient, session: SessionProvider) -> Self {
        Self {
            client: RwLock::new(client),
            session: Mutex::new(session),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<MirrorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn token(&self) -> Option<String> {
        self.client.read().await.token().map(str::to_string)
    }

    async fn call<T, F, Fut>(&self, op: F) -> Result<T, MagicApiError>
    where
        F: Fn(MagicApiClient) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, MagicApiError>> + Send,
        T: Send,
    {
        let client = self.client.read().await.clone();
        match op(client).await {
            Err(err) if err.is_auth() => {
                let refreshed = match self.reauthenticate().await {
                    Ok(client) => client,
                    Err(login_err) => {
                        warn!(error = %login_err, "re-login failed");
                        return Err(err);
                    }
                };
                op(refreshed).await
            }
            other => other,
        }
    }

    async fn reauthenticate(&self) -> Result<MagicApiClient, crate::session::SessionError> {
        let token = self.session.lock().await.refresh_now().await?;
        let refreshed = {
            let mut client = self.client.write().await;
            *client = client.with_token(token.clone());
            client.clone()
        };
        info!("session token refreshed");
        if let Some(store) = &self.store {
            match store.read_root_meta().await {
                Ok(Some(mut root)) => {
                    root.token = Some(token);
                    if let Err(err) = store.write_root_meta(&root).await {
                        warn!(error = %err, "failed to persist refreshed token");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to read root meta"),
            }
        }
        Ok(refreshed)
    }
}

impl RemoteStore for SessionRemote {
    async fn fetch_tree(&self) -> Result<ResourceTree, MagicApiError> {
        self.call(|client| async move { client.fetch_resource_tree().await })
            .await
    }

    async fn get_file(&self, id: &str) -> Result<FileEntity, MagicApiError> {
        self.call(|client| async move { client.get_file(id).await })
            .await
    }

    async fn save_file(&self, kind: &str, file: &FileEntity) -> Result<String, MagicApiError> {
        self.call(|client| async move { client.save_file(kind, file).await })
            .await
    }

    async fn delete_file(&self, id: &str) -> Result<(), MagicApiError> {
        self.call(|client| async move { client.delete_resource(id).await })
            .await
    }

    async fn get_group(&self, id: &str) -> Result<GroupEntity, MagicApiError> {
        self.call(|client| async move { client.get_group(id).await })
            .await
    }

    async fn save_group(&self, group: &GroupEntity) -> Result<String, MagicApiError> {
        self.call(|client| async move { client.save_group(group).await })
            .await
    }

    async fn delete_group(&self, id: &str) -> Result<(), MagicApiError> {
        self.call(|client| async move { client.delete_resource(id).await })
            .await
    }

    async fn fetch_workbench(&self) -> Result<WorkbenchData, MagicApiError> {
        self.call(|client| async move { client.fetch_workbench().await })
            .await
    }
}
