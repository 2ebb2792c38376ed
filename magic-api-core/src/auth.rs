use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::client::{MagicApiError, TOKEN_HEADER, unwrap_bean};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Exchanges console credentials for a session token.
#[derive(Clone)]
pub struct LoginClient {
    http: Client,
    base_url: Url,
}

impl LoginClient {
    pub fn new(base_url: &Url) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.clone(),
        }
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<String, MagicApiError> {
        let url = self.base_url.join("login")?;
        let form = [
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
        ];
        let response = self.http.post(url).form(&form).send().await?;
        let token = response
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let accepted: bool = unwrap_bean(response).await?;
        if !accepted {
            return Err(MagicApiError::Api {
                code: 0,
                message: "login rejected".into(),
            });
        }
        let token = token.ok_or(MagicApiError::MissingToken)?;
        info!(user = %credentials.username, "session established");
        Ok(token)
    }
}
