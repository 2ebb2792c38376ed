use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::models::{FileEntity, GroupEntity, ResourceTree, WorkbenchData, parse_resource_tree};

pub(crate) const TOKEN_HEADER: &str = "Magic-Token";
const SUCCESS_CODE: i64 = 1;

#[derive(Debug, Error)]
pub enum MagicApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("api returned code {code}: {message}")]
    Api { code: i64, message: String },
    #[error("api response missing data")]
    MissingData,
    #[error("malformed resource tree: {0}")]
    MalformedTree(String),
    #[error("login response carried no session token")]
    MissingToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    Transient,
    Permanent,
}

impl MagicApiError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            MagicApiError::Http { status, .. } => classify_status(*status),
            MagicApiError::Api { code, .. } if matches!(*code, 401 | 403) => ErrorClass::Auth,
            MagicApiError::Request(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.classification() == ErrorClass::Auth
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ErrorClass::Auth
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize)]
struct JsonBean<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Clone)]
pub struct MagicApiClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl MagicApiClient {
    /// `base_url` points at the web console prefix, e.g. `http://host:9999/magic/web`.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, MagicApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: normalize_base(base_url)?,
            token,
        })
    }

    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: Some(token.into()),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub async fn fetch_resource_tree(&self) -> Result<ResourceTree, MagicApiError> {
        let url = self.endpoint("resource")?;
        let data: Value = self.send(self.http.get(url)).await?;
        parse_resource_tree(data)
    }

    pub async fn get_file(&self, id: &str) -> Result<FileEntity, MagicApiError> {
        let url = self.endpoint(&format!("resource/file/{id}"))?;
        self.send(self.http.get(url)).await
    }

    /// Creates the file when `file.id` is absent, updates it otherwise. Returns the id.
    pub async fn save_file(&self, kind: &str, file: &FileEntity) -> Result<String, MagicApiError> {
        let url = self.endpoint(&format!("resource/file/{kind}/save"))?;
        let id: String = self.send(self.http.post(url).json(file)).await?;
        debug!(kind, id = %id, name = %file.name, "file saved");
        Ok(id)
    }

    pub async fn get_group(&self, id: &str) -> Result<GroupEntity, MagicApiError> {
        let url = self.endpoint(&format!("resource/folder/{id}"))?;
        self.send(self.http.get(url)).await
    }

    pub async fn save_group(&self, group: &GroupEntity) -> Result<String, MagicApiError> {
        let url = self.endpoint("resource/folder/save")?;
        let id: String = self.send(self.http.post(url).json(group)).await?;
        debug!(kind = %group.kind, id = %id, name = %group.name, "group saved");
        Ok(id)
    }

    /// Deletes a file or a group; the server resolves the id against both.
    pub async fn delete_resource(&self, id: &str) -> Result<(), MagicApiError> {
        let mut url = self.endpoint("resource/delete")?;
        url.query_pairs_mut().append_pair("id", id);
        let deleted: bool = self.send(self.http.post(url)).await?;
        if deleted {
            Ok(())
        } else {
            Err(MagicApiError::Api {
                code: 0,
                message: format!("delete of {id} was rejected"),
            })
        }
    }

    pub async fn fetch_workbench(&self) -> Result<WorkbenchData, MagicApiError> {
        let url = self.endpoint("workbench/completion")?;
        self.send(self.http.get(url)).await
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, MagicApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, MagicApiError> {
        let request = match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        };
        let response = request.send().await?;
        unwrap_bean(response).await
    }
}

pub(crate) async fn unwrap_bean<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, MagicApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(MagicApiError::Http { status, body });
    }
    let bean: JsonBean<T> = response.json().await?;
    if bean.code != SUCCESS_CODE {
        return Err(MagicApiError::Api {
            code: bean.code,
            message: bean.message,
        });
    }
    bean.data.ok_or(MagicApiError::MissingData)
}

fn normalize_base(base_url: &str) -> Result<Url, MagicApiError> {
    // Url::join drops the last segment unless the base ends with a slash.
    if base_url.ends_with('/') {
        Ok(Url::parse(base_url)?)
    } else {
        Ok(Url::parse(&format!("{base_url}/"))?)
    }
}
