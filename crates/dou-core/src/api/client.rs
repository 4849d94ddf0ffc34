use std::collections::HashSet;
use std::sync::Arc;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::{
    AuthEventBus, CredentialStore, RefreshCoordinator, RefreshError, RefreshTicket,
};
use crate::config::ClientConfig;

use super::{ApiError, ApiRequest, ApiResponse, ApiResult, Paginated};

/// Upper bound on pages fetched by [`ApiClient::get_all`].
const MAX_PAGES: usize = 1000;

/// HTTP client that attaches the stored bearer token and recovers from expired sessions.
///
/// Clones share the same refresh coordinator, so a 401 seen by any clone joins the same
/// refresh cycle.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    config: Arc<ClientConfig>,
    store: Arc<dyn CredentialStore>,
    refresh: Arc<RefreshCoordinator>,
}

struct Sent {
    status: StatusCode,
    body: String,
    /// Access token attached to the request, if any.
    token: Option<String>,
}

impl Sent {
    fn into_result(self) -> ApiResult<ApiResponse> {
        if self.status.is_success() {
            Ok(ApiResponse::new(self.status, self.body))
        } else {
            Err(ApiError::from_status(self.status, self.body))
        }
    }
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        events: AuthEventBus,
    ) -> ApiResult<Self> {
        let refresh = RefreshCoordinator::from_config(&config, store.clone(), events)?;
        Self::with_coordinator(config, store, Arc::new(refresh))
    }

    /// Build a client around an existing coordinator, sharing its refresh state.
    pub fn with_coordinator(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        refresh: Arc<RefreshCoordinator>,
    ) -> ApiResult<Self> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
            store,
            refresh,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    /// Recover from a refresh cycle abandoned mid-flight, e.g. when the app returns to
    /// the foreground.
    pub fn reset_flags(&self) {
        self.refresh.reset_flags();
    }

    /// Send `request`, refreshing the access token once if the server answers 401.
    pub async fn request(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        let sent = self.dispatch(&request, None).await?;
        if sent.status != StatusCode::UNAUTHORIZED || request.is_retried() {
            return sent.into_result();
        }

        debug!(
            method = %request.method(),
            path = request.path(),
            "access token rejected"
        );
        let retry = request.into_retry();

        let token = match self.refresh.begin(sent.token.as_deref()) {
            RefreshTicket::Current(token) => token,
            RefreshTicket::Lead(cycle) => match self.refresh.run(cycle).await {
                Ok(token) => token,
                Err(failure) => {
                    return Err(ApiError::Unauthorized {
                        body: sent.body,
                        refresh: Some(failure),
                    })
                }
            },
            RefreshTicket::Join(waiter) => match waiter.wait().await {
                Ok(token) => token,
                Err(RefreshError::Failed(failure)) => return Err(ApiError::RefreshFailed(failure)),
                Err(RefreshError::Abandoned) => return Err(ApiError::RefreshAbandoned),
            },
        };

        debug!(path = retry.path(), "replaying request with refreshed token");
        self.dispatch(&retry, Some(token)).await?.into_result()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.request(ApiRequest::get(path)).await?.json()
    }

    /// Fetch a list endpoint, unwrapping the `results` envelope when present.
    pub async fn get_list<T: DeserializeOwned>(&self, path: &str) -> ApiResult<Vec<T>> {
        Ok(self.get_json::<Paginated<T>>(path).await?.into_items())
    }

    /// Fetch every page of a list endpoint by following `next` links.
    ///
    /// Stops at a link that was already fetched, or after [`MAX_PAGES`] pages. Links
    /// outside the API base fail with [`ApiError::ForeignUrl`].
    pub async fn get_all<T: DeserializeOwned>(&self, path: &str) -> ApiResult<Vec<T>> {
        let mut items = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(path.to_owned());
        while let Some(page_path) = next.take() {
            if !visited.insert(self.config.endpoint(&page_path)?) {
                warn!(path = %page_path, "pagination loops back to a fetched page");
                break;
            }
            if visited.len() > MAX_PAGES {
                warn!(pages = MAX_PAGES, "pagination page limit reached");
                break;
            }
            let page = self.get_json::<Paginated<T>>(&page_path).await?;
            next = page.next().map(str::to_owned);
            items.extend(page.into_items());
        }
        Ok(items)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(ApiRequest::post(path).with_json(body)?)
            .await?
            .json()
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(ApiRequest::put(path).with_json(body)?)
            .await?
            .json()
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(ApiRequest::patch(path).with_json(body)?)
            .await?
            .json()
    }

    pub async fn delete(&self, path: &str) -> ApiResult<()> {
        self.request(ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Send once. The token is read from the store right before sending unless a
    /// refreshed one is supplied.
    async fn dispatch(&self, request: &ApiRequest, token: Option<String>) -> ApiResult<Sent> {
        let token = match token {
            Some(token) => Some(token),
            None => self.store.access_token()?,
        };

        let url = self.config.endpoint(request.path())?;
        if !self.config.is_within_base(&url) {
            return Err(ApiError::ForeignUrl(url));
        }
        let mut builder = self.http.request(request.method().clone(), url);
        if !request.query().is_empty() {
            builder = builder.query(request.query());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }
        if let Some(token) = &token {
            builder = builder.bearer_auth(token);
        }

        debug!(
            method = %request.method(),
            path = request.path(),
            retried = request.is_retried(),
            authenticated = token.is_some(),
            "sending request"
        );
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(Sent {
            status,
            body,
            token,
        })
    }
}
