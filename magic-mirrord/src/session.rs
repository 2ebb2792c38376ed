use magic_api_core::{Credentials, LoginClient, MagicApiError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("username and password are required to log in")]
    MissingCredentials,
    #[error("login failed: {0}")]
    Login(#[from] MagicApiError),
}

pub struct SessionProvider {
    credentials: Option<Credentials>,
    login: LoginClient,
    token: Option<String>,
}

impl SessionProvider {
    pub fn new(
        credentials: Option<Credentials>,
        login: LoginClient,
        token: Option<String>,
    ) -> Self {
        Self {
            credentials,
            login,
            token,
        }
    }

    /// Returns the cached token, logging in first when there is none.
    pub async fn valid_token(&mut self) -> Result<String, SessionError> {
        match &self.token {
            Some(token) => Ok(token.clone()),
            None => self.refresh_now().await,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub async fn refresh_now(&mut self) -> Result<String, SessionError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(SessionError::MissingCredentials)?;
        let token = self.login.login(credentials).await?;
        self.token = Some(token.clone());
        Ok(token)
    }
}
