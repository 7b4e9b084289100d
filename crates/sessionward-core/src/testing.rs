//! Test fixtures: credential minting, a scripted `AuthApi` and a canned HTTP server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::api::{ApiError, AuthApi, LoginOutcome, RenewOutcome};
use crate::auth::Credential;

pub(crate) fn jwt_with_payload(payload: &str, padded: bool) -> Credential {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let body = if padded {
        URL_SAFE.encode(payload)
    } else {
        URL_SAFE_NO_PAD.encode(payload)
    };
    Credential::from(format!("{}.{}.c2lnbmF0dXJl", header, body))
}

pub(crate) fn jwt_expiring_at(exp: i64) -> Credential {
    jwt_with_payload(&format!(r#"{{"sub":"ada","exp":{}}}"#, exp), false)
}

pub(crate) fn jwt_expiring_in(secs: i64) -> Credential {
    jwt_expiring_at(Utc::now().timestamp() + secs)
}

pub(crate) fn opaque_credential() -> Credential {
    Credential::from("opaque-session-handle")
}

/// Scripted [`AuthApi`]. Unscripted renewals are rejected.
#[derive(Default)]
pub(crate) struct MockAuthApi {
    logins: Mutex<VecDeque<Result<LoginOutcome, ApiError>>>,
    renewals: Mutex<VecDeque<Result<RenewOutcome, ApiError>>>,
    renew_delay: Duration,
    end_session_error: bool,
    end_session_delay: Option<Duration>,
    pub login_calls: AtomicUsize,
    pub renew_calls: AtomicUsize,
    pub end_session_calls: AtomicUsize,
}

impl MockAuthApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_renew_delay(mut self, delay: Duration) -> Self {
        self.renew_delay = delay;
        self
    }

    pub fn with_failing_end_session(mut self) -> Self {
        self.end_session_error = true;
        self
    }

    pub fn with_hanging_end_session(mut self, delay: Duration) -> Self {
        self.end_session_delay = Some(delay);
        self
    }

    pub fn push_login(&self, outcome: Result<LoginOutcome, ApiError>) {
        self.logins.lock().unwrap().push_back(outcome);
    }

    pub fn push_renewal(&self, credential: &Credential, elevated: Option<bool>) {
        self.renewals.lock().unwrap().push_back(Ok(RenewOutcome {
            credential: credential.expose().to_string(),
            elevated,
        }));
    }

    pub fn push_renewal_error(&self, error: ApiError) {
        self.renewals.lock().unwrap().push_back(Err(error));
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }
}

impl AuthApi for MockAuthApi {
    fn login<'a>(
        &'a self,
        _identifier: &'a str,
        _secret: &'a str,
    ) -> BoxFuture<'a, Result<LoginOutcome, ApiError>> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .logins
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::InvalidCredentials));
        async move { outcome }.boxed()
    }

    fn renew(&self) -> BoxFuture<'_, Result<RenewOutcome, ApiError>> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .renewals
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::RenewalRejected("no scripted renewal".into())));
        let delay = self.renew_delay;
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
        .boxed()
    }

    fn end_session<'a>(&'a self, _credential: Option<&'a Credential>) -> BoxFuture<'a, Result<(), ApiError>> {
        self.end_session_calls.fetch_add(1, Ordering::SeqCst);
        let fail = self.end_session_error;
        let delay = self.end_session_delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                Err(ApiError::ServerError("logout unavailable".into()))
            } else {
                Ok(())
            }
        }
        .boxed()
    }
}

/// One canned reply for [`StubServer`].
pub(crate) struct StubResponse {
    status: u16,
    headers: Vec<String>,
    body: String,
}

impl StubResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, line: &str) -> Self {
        self.headers.push(line.to_string());
        self
    }

    fn render(&self) -> String {
        let mut out = format!(
            "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
            self.status,
            self.body.len()
        );
        for header in &self.headers {
            out.push_str(header);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

/// HTTP/1.1 server on a loopback port answering one scripted response per
/// connection, in order, and recording each raw request.
pub(crate) struct StubServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    pub async fn start(responses: Vec<StubResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                seen.lock().unwrap().push(request);
                let _ = stream.write_all(response.render().as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Read the head and, per content-length, the body of one request.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut expected = None;

    loop {
        if expected.is_none() {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                expected = Some(end + 4 + length);
            }
        }
        if expected.is_some_and(|total| buf.len() >= total) {
            break;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    String::from_utf8_lossy(&buf).into_owned()
}
