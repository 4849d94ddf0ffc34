use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::api::{ApiError, ApiResult};
use crate::config::ClientConfig;

use super::tokens::jwt_expiry;
use super::{AuthError, AuthEvent, AuthEventBus, CredentialPair, CredentialStore};

const LOGIN_PATH: &str = "auth/login/";
const REGISTER_PATH: &str = "auth/register/";

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
struct TokenPair {
    access: String,
    refresh: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenPayload {
    Flat(TokenPair),
    Nested { tokens: TokenPair },
}

impl From<TokenPayload> for CredentialPair {
    fn from(payload: TokenPayload) -> Self {
        let pair = match payload {
            TokenPayload::Flat(pair) | TokenPayload::Nested { tokens: pair } => pair,
        };
        CredentialPair::new(pair.access, pair.refresh)
    }
}

/// Creates and destroys sessions: login, registration and logout.
///
/// Talks to the API without the authenticated client, since these calls establish the
/// credentials in the first place.
pub struct SessionService {
    http: Client,
    login_url: Url,
    register_url: Url,
    store: Arc<dyn CredentialStore>,
    events: AuthEventBus,
}

impl SessionService {
    pub fn new(
        config: &ClientConfig,
        store: Arc<dyn CredentialStore>,
        events: AuthEventBus,
    ) -> ApiResult<Self> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            login_url: config.endpoint(LOGIN_PATH)?,
            register_url: config.endpoint(REGISTER_PATH)?,
            store,
            events,
        })
    }

    pub async fn login(&self, request: &LoginRequest) -> ApiResult<CredentialPair> {
        let pair = self.obtain(self.login_url.clone(), request).await?;
        info!(username = %request.username, "logged in");
        Ok(pair)
    }

    pub async fn register(&self, request: &RegisterRequest) -> ApiResult<CredentialPair> {
        let pair = self.obtain(self.register_url.clone(), request).await?;
        info!(username = %request.username, "registered new account");
        Ok(pair)
    }

    /// Forget stored credentials and notify observers.
    pub fn logout(&self) -> Result<(), AuthError> {
        self.store.clear()?;
        info!("logged out");
        self.events.publish(AuthEvent::Logout);
        Ok(())
    }

    pub fn is_authenticated(&self) -> Result<bool, AuthError> {
        Ok(self
            .store
            .access_token()?
            .is_some_and(|token| !token.is_empty()))
    }

    /// Expiry of the stored access token, when it is a JWT carrying `exp`.
    pub fn token_expiry(&self) -> Result<Option<DateTime<Utc>>, AuthError> {
        Ok(self
            .store
            .access_token()?
            .and_then(|token| jwt_expiry(&token)))
    }

    async fn obtain<B: Serialize>(&self, url: Url, body: &B) -> ApiResult<CredentialPair> {
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_status(status, text));
        }

        let payload: TokenPayload = serde_json::from_str(&text)?;
        let pair = CredentialPair::from(payload);
        self.store.save_pair(&pair)?;
        self.events.publish(AuthEvent::Login);
        Ok(pair)
    }
}
