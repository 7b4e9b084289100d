//! JSON API client whose every call passes through the [`RequestGate`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use super::{ApiError, RequestGate};
use crate::auth::{Credential, SessionManager};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the application's resource endpoints.
/// Clone is cheap - reqwest::Client and the session handle are both Arc inside.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Arc<str>,
    gate: RequestGate,
    initial_backoff: Duration,
}

impl ApiClient {
    /// `client` should be the one the session's `HttpAuthApi` uses so the
    /// renewal cookie and the connection pool are shared.
    pub fn new(client: Client, base_url: &str, session: SessionManager) -> Self {
        Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            gate: RequestGate::new(session),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// First delay after a 429; doubles on each further retry.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn session(&self) -> &SessionManager {
        self.gate.session()
    }

    fn endpoint(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        self.gate
            .execute(|credential| self.send(Method::GET, &url, None, credential))
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        let body = serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.gate
            .execute(|credential| self.send(Method::POST, &url, Some(&body), credential))
            .await
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        credential: Option<Credential>,
    ) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(ref credential) = credential {
                request = request.bearer_auth(credential.expose());
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(ApiError::from_send)?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    return response.json().await.map_err(|e| {
                        ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2; // Exponential backoff
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryStorage, SessionOptions, SessionStorage, Slot};
    use crate::testing::{jwt_expiring_in, MockAuthApi, StubResponse, StubServer};

    fn session_with(credential: Option<&Credential>) -> SessionManager {
        let storage = MemoryStorage::new();
        if let Some(credential) = credential {
            storage.write(Slot::Credential, credential.expose()).unwrap();
        }
        SessionManager::restore(Arc::new(MockAuthApi::new()), Arc::new(storage), SessionOptions::default())
    }

    fn client_for(server: &StubServer, session: SessionManager) -> ApiClient {
        ApiClient::new(Client::new(), server.base_url(), session).with_initial_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_endpoint_joining() {
        let api = ApiClient::new(Client::new(), "https://api.example.com/", session_with(None));

        assert_eq!(api.endpoint("/catalog/items"), "https://api.example.com/catalog/items");
        assert_eq!(api.endpoint("catalog/items"), "https://api.example.com/catalog/items");
    }

    #[tokio::test]
    async fn test_get_attaches_bearer_credential() {
        let credential = jwt_expiring_in(3600);
        let server = StubServer::start(vec![StubResponse::json(200, r#"{"items":[1,2]}"#)]).await;
        let api = client_for(&server, session_with(Some(&credential)));

        let body: serde_json::Value = api.get("/catalog").await.unwrap();

        assert_eq!(body["items"][1], 2);
        let requests = server.requests();
        assert!(requests[0].starts_with("GET /catalog "));
        let expected = format!("authorization: bearer {}", credential.expose()).to_lowercase();
        assert!(requests[0].to_lowercase().contains(&expected));
    }

    #[tokio::test]
    async fn test_anonymous_post_sends_no_authorization() {
        let server = StubServer::start(vec![StubResponse::json(200, r#"{"ok":true}"#)]).await;
        let api = client_for(&server, session_with(None));

        let body: serde_json::Value = api.post("/feedback", &serde_json::json!({"text": "hi"})).await.unwrap();

        assert_eq!(body["ok"], true);
        let request = server.requests()[0].to_lowercase();
        assert!(!request.contains("authorization:"));
        assert!(request.contains(r#"{"text":"hi"}"#));
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_succeeds() {
        let server = StubServer::start(vec![
            StubResponse::json(429, ""),
            StubResponse::json(429, ""),
            StubResponse::json(200, r#"{"n":1}"#),
        ])
        .await;
        let api = client_for(&server, session_with(None));

        let body: serde_json::Value = api.get("/catalog").await.unwrap();

        assert_eq!(body["n"], 1);
        assert_eq!(server.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up_after_max_retries() {
        let responses = (0..=MAX_RATE_LIMIT_RETRIES + 1).map(|_| StubResponse::json(429, "")).collect();
        let server = StubServer::start(responses).await;
        let api = client_for(&server, session_with(None));

        let result: Result<serde_json::Value, ApiError> = api.get("/catalog").await;

        assert!(matches!(result, Err(ApiError::RateLimited)));
        assert_eq!(server.requests().len(), MAX_RATE_LIMIT_RETRIES as usize + 1);
    }
}
