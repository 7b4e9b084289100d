//! Authentication collaborator: login, renew, end session.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ApiError;
use crate::auth::Credential;

/// Login endpoint, relative to the API base URL
const LOGIN_PATH: &str = "/auth/login";

/// Renewal endpoint; authenticated by the HTTP-only renewal cookie
const RENEW_PATH: &str = "/auth/refresh";

const LOGOUT_PATH: &str = "/auth/logout";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    #[serde(default, alias = "token")]
    pub credential: Option<String>,
    #[serde(default)]
    pub pending_verification: bool,
    #[serde(default, alias = "isAdmin")]
    pub elevated: bool,
    #[serde(default)]
    pub identity_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewOutcome {
    #[serde(alias = "token")]
    pub credential: String,
    /// `None` when the server omitted the flag.
    #[serde(default, alias = "isAdmin")]
    pub elevated: Option<bool>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    identifier: &'a str,
    secret: &'a str,
}

/// Login failures are surfaced to the user as they are.
fn login_error(status: StatusCode, body: &str) -> ApiError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => ApiError::InvalidCredentials,
        StatusCode::FORBIDDEN | StatusCode::LOCKED => ApiError::AccountLocked(ApiError::truncate_body(body)),
        _ => ApiError::from_status(status, body),
    }
}

/// Any client-side refusal of the renewal cookie ends the session.
fn renewal_error(status: StatusCode, body: &str) -> ApiError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::RenewalRejected(format!("status {}", status))
        }
        _ => ApiError::from_status(status, body),
    }
}

/// The server-side operations the session depends on.
pub trait AuthApi: Send + Sync {
    fn login<'a>(
        &'a self,
        identifier: &'a str,
        secret: &'a str,
    ) -> BoxFuture<'a, Result<LoginOutcome, ApiError>>;

    fn renew(&self) -> BoxFuture<'_, Result<RenewOutcome, ApiError>>;

    /// Best-effort server-side logout.
    fn end_session<'a>(&'a self, credential: Option<&'a Credential>) -> BoxFuture<'a, Result<(), ApiError>>;
}

/// [`AuthApi`] over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally, and clones share the cookie jar.
#[derive(Clone)]
pub struct HttpAuthApi {
    client: Client,
    base_url: String,
}

impl HttpAuthApi {
    /// Create a client with its own connection pool and cookie store.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The underlying client, for sharing the pool and cookie jar with [`super::ApiClient`].
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn error_body(response: reqwest::Response) -> (StatusCode, String) {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        (status, body)
    }

    async fn do_login(&self, identifier: &str, secret: &str) -> Result<LoginOutcome, ApiError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .header(header::ACCEPT, "application/json")
            .json(&LoginRequest { identifier, secret })
            .send()
            .await
            .map_err(ApiError::from_send)?;

        if response.status().is_success() {
            return response
                .json()
                .await
                .map_err(|e| ApiError::InvalidResponse(format!("login response: {}", e)));
        }

        let (status, body) = Self::error_body(response).await;
        debug!(%status, "Login rejected");
        Err(login_error(status, &body))
    }

    async fn do_renew(&self) -> Result<RenewOutcome, ApiError> {
        let response = self
            .client
            .post(self.url(RENEW_PATH))
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(ApiError::from_send)?;

        if response.status().is_success() {
            return response
                .json()
                .await
                .map_err(|e| ApiError::InvalidResponse(format!("renewal response: {}", e)));
        }

        let (status, body) = Self::error_body(response).await;
        debug!(%status, "Renewal refused");
        Err(renewal_error(status, &body))
    }

    async fn do_end_session(&self, credential: Option<&Credential>) -> Result<(), ApiError> {
        let mut request = self.client.post(self.url(LOGOUT_PATH));
        if let Some(credential) = credential {
            request = request.bearer_auth(credential.expose());
        }

        let response = request.send().await.map_err(ApiError::from_send)?;
        if response.status().is_success() {
            Ok(())
        } else {
            let (status, body) = Self::error_body(response).await;
            Err(ApiError::from_status(status, &body))
        }
    }
}

impl AuthApi for HttpAuthApi {
    fn login<'a>(
        &'a self,
        identifier: &'a str,
        secret: &'a str,
    ) -> BoxFuture<'a, Result<LoginOutcome, ApiError>> {
        self.do_login(identifier, secret).boxed()
    }

    fn renew(&self) -> BoxFuture<'_, Result<RenewOutcome, ApiError>> {
        self.do_renew().boxed()
    }

    fn end_session<'a>(&'a self, credential: Option<&'a Credential>) -> BoxFuture<'a, Result<(), ApiError>> {
        self.do_end_session(credential).boxed()
    }
}
