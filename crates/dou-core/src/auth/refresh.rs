//! Single-flight access token refresh.
//!
//! Every request that sees an expired session asks the [`RefreshCoordinator`] for a new
//! access token. The first caller leads a refresh cycle; callers arriving while the cycle
//! is in flight join it and receive the same outcome once it settles.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientConfig;

use super::{AuthError, AuthEvent, AuthEventBus, CredentialKey, CredentialStore};

const REFRESH_PATH: &str = "auth/refresh/";

/// Tokens returned by the refresh endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access: String,
    /// Present only when the server rotates refresh tokens.
    pub refresh: Option<String>,
}

impl std::fmt::Debug for RefreshedTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedTokens")
            .field("rotated", &self.refresh.is_some())
            .finish_non_exhaustive()
    }
}

/// Calls the refresh endpoint directly, outside of the authenticated client.
#[derive(Debug, Clone)]
pub struct RefreshClient {
    http: Client,
    endpoint: Url,
}

impl RefreshClient {
    pub fn new(config: &ClientConfig) -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint(REFRESH_PATH)?,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            refresh: &'a str,
        }

        #[derive(Deserialize)]
        struct RefreshResponse {
            access: Option<String>,
            refresh: Option<String>,
        }

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AuthError::TokenEndpoint { status, body });
        }

        let payload: RefreshResponse = serde_json::from_str(&body)
            .map_err(|err| AuthError::MalformedTokenResponse(err.to_string()))?;
        let access = payload
            .access
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::MalformedTokenResponse("missing `access` field".into()))?;

        Ok(RefreshedTokens {
            access,
            refresh: payload.refresh.filter(|token| !token.is_empty()),
        })
    }
}

/// Shareable description of why a refresh cycle failed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RefreshFailure {
    /// Status returned by the refresh endpoint, when it answered at all.
    pub status: Option<StatusCode>,
    pub message: String,
}

impl From<&AuthError> for RefreshFailure {
    fn from(err: &AuthError) -> Self {
        let status = match err {
            AuthError::TokenEndpoint { status, .. } => Some(*status),
            _ => None,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

/// Outcome observed by callers that joined a refresh cycle.
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("token refresh failed: {0}")]
    Failed(RefreshFailure),
    #[error("token refresh was abandoned before it settled")]
    Abandoned,
}

type Outcome = Result<String, RefreshFailure>;

/// What a caller holding an expired token should do next.
#[derive(Debug)]
pub enum RefreshTicket {
    /// No refresh in flight: the caller runs this cycle via [`RefreshCoordinator::run`].
    Lead(RefreshCycle),
    /// A refresh is in flight: wait for its outcome.
    Join(RefreshWaiter),
    /// The store already holds a newer token than the one that was rejected.
    Current(String),
}

/// Handle to a refresh cycle owned by the leading caller.
#[derive(Debug)]
pub struct RefreshCycle {
    id: u64,
}

impl RefreshCycle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Receives the outcome of a cycle led by another caller.
#[derive(Debug)]
pub struct RefreshWaiter {
    receiver: watch::Receiver<Option<Outcome>>,
}

impl RefreshWaiter {
    pub async fn wait(mut self) -> Result<String, RefreshError> {
        loop {
            if let Some(outcome) = self.receiver.borrow_and_update().clone() {
                return outcome.map_err(RefreshError::Failed);
            }
            if self.receiver.changed().await.is_err() {
                // The cycle was dropped; it may still have settled right before.
                return match self.receiver.borrow().clone() {
                    Some(outcome) => outcome.map_err(RefreshError::Failed),
                    None => Err(RefreshError::Abandoned),
                };
            }
        }
    }
}

struct InFlight {
    id: u64,
    settled: watch::Sender<Option<Outcome>>,
}

#[derive(Default)]
struct RefreshState {
    in_flight: Option<InFlight>,
    next_cycle: u64,
    logging_out: bool,
    logout_epoch: u64,
}

fn lock(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the refresh state (`isRefreshing`, the waiter set, the logging-out guard).
///
/// The state is only touched in short critical sections that never span an `.await`.
pub struct RefreshCoordinator {
    store: Arc<dyn CredentialStore>,
    client: RefreshClient,
    events: AuthEventBus,
    logout_guard_delay: Duration,
    state: Arc<Mutex<RefreshState>>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: RefreshClient,
        events: AuthEventBus,
        logout_guard_delay: Duration,
    ) -> Self {
        Self {
            store,
            client,
            events,
            logout_guard_delay,
            state: Arc::new(Mutex::new(RefreshState::default())),
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        store: Arc<dyn CredentialStore>,
        events: AuthEventBus,
    ) -> Result<Self, AuthError> {
        Ok(Self::new(
            store,
            RefreshClient::new(config)?,
            events,
            config.logout_guard_delay,
        ))
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.state).in_flight.is_some()
    }

    pub fn is_logging_out(&self) -> bool {
        lock(&self.state).logging_out
    }

    /// Number of callers currently waiting on the in-flight cycle.
    pub fn waiting(&self) -> usize {
        lock(&self.state)
            .in_flight
            .as_ref()
            .map(|cycle| cycle.settled.receiver_count())
            .unwrap_or(0)
    }

    /// Decide how a caller whose request was rejected with `rejected_token` proceeds.
    ///
    /// Pass `None` to skip the stale-token check (forced refresh, or no token was sent).
    pub fn begin(&self, rejected_token: Option<&str>) -> RefreshTicket {
        let stored = match rejected_token {
            Some(_) => self.store.access_token().ok().flatten(),
            None => None,
        };

        let mut state = lock(&self.state);
        if let Some(cycle) = &state.in_flight {
            debug!(cycle = cycle.id, "joining in-flight token refresh");
            return RefreshTicket::Join(RefreshWaiter {
                receiver: cycle.settled.subscribe(),
            });
        }

        if let (Some(rejected), Some(stored)) = (rejected_token, stored) {
            if rejected != stored {
                debug!("request used a superseded access token; replaying with the stored one");
                return RefreshTicket::Current(stored);
            }
        }

        state.next_cycle += 1;
        let id = state.next_cycle;
        let (settled, _) = watch::channel(None);
        state.in_flight = Some(InFlight { id, settled });
        RefreshTicket::Lead(RefreshCycle { id })
    }

    /// Run a cycle obtained from [`begin`](Self::begin) to completion.
    ///
    /// On success the new access token is persisted before any waiter is woken. On failure
    /// waiters receive the same failure and the forced logout runs at most once.
    pub async fn run(&self, cycle: RefreshCycle) -> Result<String, RefreshFailure> {
        let mut guard = CycleGuard {
            state: &self.state,
            id: cycle.id,
            settled: false,
        };
        info!(cycle = cycle.id, "refreshing access token");

        let outcome = self.exchange().await.map_err(|err| {
            warn!(cycle = cycle.id, error = %err, "access token refresh failed");
            RefreshFailure::from(&err)
        });

        // Credentials are gone before the flag drops, so a late 401 cannot lead a second
        // exchange with the rejected refresh token.
        if outcome.is_err() {
            self.force_logout();
        }
        guard.settle(outcome.clone());
        if outcome.is_ok() {
            info!(cycle = cycle.id, "access token refreshed");
        }
        outcome
    }

    /// Refresh now, or join the cycle already in flight.
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        match self.begin(None) {
            RefreshTicket::Lead(cycle) => self.run(cycle).await.map_err(RefreshError::Failed),
            RefreshTicket::Join(waiter) => waiter.wait().await,
            RefreshTicket::Current(token) => Ok(token),
        }
    }

    /// Clear the refreshing flag, the logging-out guard and all waiters.
    ///
    /// Meant for when the application returns to the foreground after a cycle may have
    /// been abandoned. Waiters of the dropped cycle fail with [`RefreshError::Abandoned`].
    pub fn reset_flags(&self) {
        let mut state = lock(&self.state);
        if let Some(cycle) = state.in_flight.take() {
            debug!(cycle = cycle.id, "dropping in-flight refresh cycle");
        }
        state.logging_out = false;
        state.logout_epoch += 1;
    }

    async fn exchange(&self) -> Result<String, AuthError> {
        let refresh_token = self
            .store
            .refresh_token()?
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingRefreshToken)?;

        let tokens = self.client.refresh(&refresh_token).await?;
        self.store.set(CredentialKey::AccessToken, &tokens.access)?;
        if let Some(rotated) = &tokens.refresh {
            self.store.set(CredentialKey::RefreshToken, rotated)?;
        }
        Ok(tokens.access)
    }

    fn force_logout(&self) {
        let epoch = {
            let mut state = lock(&self.state);
            if state.logging_out {
                debug!("forced logout already in progress");
                return;
            }
            state.logging_out = true;
            state.logout_epoch += 1;
            state.logout_epoch
        };

        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to clear stored credentials");
        }
        warn!("session expired; credentials cleared");
        self.events.publish(AuthEvent::TokenExpired);

        let state = Arc::clone(&self.state);
        let delay = self.logout_guard_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = lock(&state);
            if state.logout_epoch == epoch {
                state.logging_out = false;
            }
        });
    }
}

/// Settles the cycle it guards; dropping it unsettled abandons the cycle so that
/// waiters are released and the next 401 starts over.
struct CycleGuard<'a> {
    state: &'a Mutex<RefreshState>,
    id: u64,
    settled: bool,
}

impl CycleGuard<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        let mut state = lock(self.state);
        match state.in_flight.take() {
            Some(cycle) if cycle.id == self.id => {
                cycle.settled.send_replace(Some(outcome));
            }
            other => {
                debug!(cycle = self.id, "refresh cycle was reset before it settled");
                state.in_flight = other;
            }
        }
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = lock(self.state);
        match state.in_flight.take() {
            Some(cycle) if cycle.id == self.id => {
                warn!(cycle = self.id, "refresh cycle dropped before settling");
            }
            other => state.in_flight = other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialPair, MemoryCredentialStore};
    use httpmock::prelude::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn coordinator(
        server: &MockServer,
        store: Arc<MemoryCredentialStore>,
        events: AuthEventBus,
    ) -> RefreshCoordinator {
        coordinator_with_guard(server, store, events, Duration::from_secs(1))
    }

    fn coordinator_with_guard(
        server: &MockServer,
        store: Arc<MemoryCredentialStore>,
        events: AuthEventBus,
        guard_delay: Duration,
    ) -> RefreshCoordinator {
        let config = ClientConfig::parse(&server.url("/api"))
            .unwrap()
            .with_logout_guard_delay(guard_delay);
        RefreshCoordinator::from_config(&config, store, events).unwrap()
    }

    fn seeded_store() -> Arc<MemoryCredentialStore> {
        Arc::new(MemoryCredentialStore::with_pair(&CredentialPair::new(
            "tok1", "ref1",
        )))
    }

    #[tokio::test]
    async fn refresh_client_parses_access_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/auth/refresh/")
                    .json_body(serde_json::json!({ "refresh": "ref1" }));
                then.status(200)
                    .json_body(serde_json::json!({ "access": "tok2" }));
            })
            .await;

        let config = ClientConfig::parse(&server.url("/api")).unwrap();
        let client = RefreshClient::new(&config).unwrap();
        let tokens = client.refresh("ref1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(tokens.access, "tok2");
        assert!(tokens.refresh.is_none());
    }

    #[tokio::test]
    async fn refresh_client_rejects_malformed_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh/");
                then.status(200).json_body(serde_json::json!({ "token": "x" }));
            })
            .await;

        let config = ClientConfig::parse(&server.url("/api")).unwrap();
        let client = RefreshClient::new(&config).unwrap();
        let err = client.refresh("ref1").await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedTokenResponse(_)));
    }

    #[tokio::test]
    async fn refresh_client_reports_endpoint_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh/");
                then.status(401).body(r#"{"detail":"Token is invalid or expired"}"#);
            })
            .await;

        let config = ClientConfig::parse(&server.url("/api")).unwrap();
        let client = RefreshClient::new(&config).unwrap();
        match client.refresh("ref1").await.unwrap_err() {
            AuthError::TokenEndpoint { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert!(body.contains("Token is invalid"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh/");
                then.status(200)
                    .delay(Duration::from_millis(200))
                    .json_body(serde_json::json!({ "access": "tok2", "refresh": "ref2" }));
            })
            .await;

        let store = seeded_store();
        let coordinator = coordinator(&server, store.clone(), AuthEventBus::new());

        let RefreshTicket::Lead(cycle) = coordinator.begin(Some("tok1")) else {
            panic!("first caller should lead");
        };
        let waiters: Vec<_> = (0..3)
            .map(|_| match coordinator.begin(Some("tok1")) {
                RefreshTicket::Join(waiter) => {
                    let store = store.clone();
                    tokio::spawn(async move {
                        let token = waiter.wait().await.unwrap();
                        // Must already be persisted when the waiter wakes.
                        assert_eq!(store.access_token().unwrap(), Some(token.clone()));
                        token
                    })
                }
                other => panic!("expected to join, got {other:?}"),
            })
            .collect();
        assert!(coordinator.is_refreshing());

        let led = coordinator.run(cycle).await.unwrap();
        assert_eq!(led, "tok2");
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), "tok2");
        }

        mock.assert_hits_async(1).await;
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.waiting(), 0);
        assert_eq!(store.access_token().unwrap().as_deref(), Some("tok2"));
        assert_eq!(store.refresh_token().unwrap().as_deref(), Some("ref2"));
    }

    #[tokio::test]
    async fn failure_clears_credentials_and_notifies_once() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh/");
                then.status(400).delay(Duration::from_millis(100)).body("bad");
            })
            .await;

        let store = seeded_store();
        let events = AuthEventBus::new();
        let mut observed = events.subscribe();
        let coordinator = coordinator(&server, store.clone(), events);

        let RefreshTicket::Lead(cycle) = coordinator.begin(Some("tok1")) else {
            panic!("first caller should lead");
        };
        let RefreshTicket::Join(waiter) = coordinator.begin(Some("tok1")) else {
            panic!("second caller should join");
        };

        let (led, joined) = tokio::join!(coordinator.run(cycle), waiter.wait());
        assert_eq!(led.unwrap_err().status, Some(StatusCode::BAD_REQUEST));
        assert!(matches!(joined, Err(RefreshError::Failed(_))));
        mock.assert_hits_async(1).await;

        assert!(store.access_token().unwrap().is_none());
        assert!(store.refresh_token().unwrap().is_none());
        assert_eq!(observed.try_recv().unwrap(), AuthEvent::TokenExpired);
        assert!(matches!(observed.try_recv(), Err(TryRecvError::Empty)));

        // A second failure inside the guard window does not publish again.
        assert!(coordinator.is_logging_out());
        assert!(coordinator.refresh().await.is_err());
        assert!(matches!(observed.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_calling_endpoint() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh/");
                then.status(200).json_body(serde_json::json!({ "access": "tok2" }));
            })
            .await;

        let store = Arc::new(MemoryCredentialStore::new());
        store.set(CredentialKey::AccessToken, "tok1").unwrap();
        let events = AuthEventBus::new();
        let mut observed = events.subscribe();
        let coordinator = coordinator(&server, store.clone(), events);

        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::Failed(_)));
        assert_eq!(mock.hits_async().await, 0);
        assert!(store.access_token().unwrap().is_none());
        assert_eq!(observed.try_recv().unwrap(), AuthEvent::TokenExpired);
    }

    #[tokio::test]
    async fn logout_guard_rearms_after_delay() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh/");
                then.status(400);
            })
            .await;

        let store = seeded_store();
        let events = AuthEventBus::new();
        let mut observed = events.subscribe();
        let coordinator =
            coordinator_with_guard(&server, store.clone(), events, Duration::from_millis(50));

        assert!(coordinator.refresh().await.is_err());
        assert!(coordinator.is_logging_out());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!coordinator.is_logging_out());

        store.save_pair(&CredentialPair::new("tok3", "ref3")).unwrap();
        assert!(coordinator.refresh().await.is_err());
        assert_eq!(observed.try_recv().unwrap(), AuthEvent::TokenExpired);
        assert_eq!(observed.try_recv().unwrap(), AuthEvent::TokenExpired);
    }

    #[tokio::test]
    async fn reset_flags_releases_waiters_and_allows_new_cycle() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh/");
                then.status(200).json_body(serde_json::json!({ "access": "tok2" }));
            })
            .await;

        let store = seeded_store();
        let coordinator = coordinator(&server, store.clone(), AuthEventBus::new());

        // A cycle whose leader never ran, e.g. the app was suspended mid-refresh.
        let RefreshTicket::Lead(stuck) = coordinator.begin(Some("tok1")) else {
            panic!("first caller should lead");
        };
        let RefreshTicket::Join(waiter) = coordinator.begin(Some("tok1")) else {
            panic!("second caller should join");
        };
        assert_eq!(coordinator.waiting(), 1);

        coordinator.reset_flags();
        assert!(!coordinator.is_refreshing());
        assert!(matches!(waiter.wait().await, Err(RefreshError::Abandoned)));

        let RefreshTicket::Lead(fresh) = coordinator.begin(Some("tok1")) else {
            panic!("reset should allow a fresh cycle");
        };
        assert_ne!(fresh.id(), stuck.id());
        assert_eq!(coordinator.run(fresh).await.unwrap(), "tok2");
        mock.assert_hits_async(1).await;

        // The stale leader settling late must not disturb a newer cycle.
        let RefreshTicket::Lead(newer) = coordinator.begin(None) else {
            panic!("expected a new cycle");
        };
        assert!(coordinator.run(stuck).await.is_ok());
        assert!(coordinator.is_refreshing());
        coordinator.run(newer).await.unwrap();
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn dropped_leader_abandons_cycle() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/auth/refresh/");
                then.status(200)
                    .delay(Duration::from_secs(5))
                    .json_body(serde_json::json!({ "access": "tok2" }));
            })
            .await;

        let coordinator = coordinator(&server, seeded_store(), AuthEventBus::new());
        let RefreshTicket::Lead(cycle) = coordinator.begin(Some("tok1")) else {
            panic!("first caller should lead");
        };
        let RefreshTicket::Join(waiter) = coordinator.begin(Some("tok1")) else {
            panic!("second caller should join");
        };

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), coordinator.run(cycle)).await;
        assert!(timed_out.is_err());
        assert!(!coordinator.is_refreshing());
        assert!(matches!(waiter.wait().await, Err(RefreshError::Abandoned)));
    }

    #[test]
    fn superseded_token_replays_without_refresh() {
        let config = ClientConfig::parse("http://127.0.0.1:9/api").unwrap();
        let store = Arc::new(MemoryCredentialStore::with_pair(&CredentialPair::new(
            "tok2", "ref1",
        )));
        let coordinator =
            RefreshCoordinator::from_config(&config, store, AuthEventBus::new()).unwrap();
        match coordinator.begin(Some("tok1")) {
            RefreshTicket::Current(token) => assert_eq!(token, "tok2"),
            other => panic!("unexpected ticket: {other:?}"),
        }
        assert!(!coordinator.is_refreshing());
    }
}
