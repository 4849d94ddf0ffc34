//! Authenticated REST client for the Dou API.
//!
//! [`api::ApiClient`] attaches the stored bearer token to every request and, when the
//! server answers 401, refreshes the token once for all concurrently failing requests
//! through [`auth::RefreshCoordinator`]. Failed refreshes clear the stored credentials
//! and publish [`auth::AuthEvent::TokenExpired`] on the injected [`auth::AuthEventBus`].

pub mod api;
pub mod auth;
pub mod config;

use std::sync::Arc;

use api::{ApiClient, ApiResult};
use auth::{AuthEventBus, CredentialStore, SessionService};
use config::ClientConfig;

/// Everything a front-end needs, wired around one credential store and one event bus.
pub struct DouClient {
    pub api: ApiClient,
    pub session: SessionService,
    pub events: AuthEventBus,
}

impl DouClient {
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> ApiResult<Self> {
        let events = AuthEventBus::new();
        let session = SessionService::new(&config, store.clone(), events.clone())?;
        let api = ApiClient::new(config, store, events.clone())?;
        Ok(Self {
            api,
            session,
            events,
        })
    }
}
