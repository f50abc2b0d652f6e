use crate::error::{map_anyhow_error, ApiError, ApiResult};
use crate::types::{AuthorizationGrant, ConnectionRequest, OAuthConnection};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Backend endpoints consumed by the connection coordinator.
#[async_trait]
pub trait ConnectionsBackend: Send + Sync {
    /// `GET /authorize?provider&service` for the signed-in user.
    async fn authorize(&self, request: &ConnectionRequest) -> ApiResult<AuthorizationGrant>;

    /// `GET /connections`. Read-only.
    async fn list_connections(&self) -> ApiResult<Vec<OAuthConnection>>;

    /// `DELETE /connections/{provider}/{service}`.
    async fn disconnect(&self, request: &ConnectionRequest) -> ApiResult<()>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConnectionList {
    Bare(Vec<OAuthConnection>),
    Wrapped { connections: Vec<OAuthConnection> },
}

impl From<ConnectionList> for Vec<OAuthConnection> {
    fn from(list: ConnectionList) -> Self {
        match list {
            ConnectionList::Bare(connections) | ConnectionList::Wrapped { connections } => {
                connections
            }
        }
    }
}

#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

enum RetryDecision {
    Retry(Duration),
    Fail,
}

fn calculate_backoff(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..500);
    let exponential = BASE_DELAY_MS * 2u64.pow(attempt);
    Duration::from_millis((exponential + jitter).min(MAX_BACKOFF_MS))
}

fn retry_decision(error: &anyhow::Error) -> RetryDecision {
    if let Some(api_err) = error.downcast_ref::<ApiError>() {
        return match api_err {
            ApiError::RateLimited { retry_after } => {
                RetryDecision::Retry(Duration::from_secs(*retry_after))
            }
            e if e.is_retryable() => RetryDecision::Retry(Duration::ZERO),
            _ => RetryDecision::Fail,
        };
    }
    match error.downcast_ref::<reqwest::Error>() {
        Some(req_err) if is_transient_network_error(req_err) => {
            RetryDecision::Retry(Duration::ZERO)
        }
        _ => RetryDecision::Fail,
    }
}

fn is_transient_network_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout() || error.is_request()
}

async fn with_retry<T, F, Fut>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= MAX_RETRIES {
                    return Err(e);
                }
                match retry_decision(&e) {
                    RetryDecision::Fail => return Err(e),
                    RetryDecision::Retry(override_delay) => {
                        let delay = if override_delay.is_zero() {
                            calculate_backoff(attempts)
                        } else {
                            override_delay
                        };
                        debug!(attempt = attempts, ?delay, "Retrying after error: {e}");
                        tokio::time::sleep(delay).await;
                        attempts += 1;
                    }
                }
            }
        }
    }
}

/// Turns a non-2xx response into a typed [`ApiError`].
async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited {
            retry_after: retry_after.unwrap_or(60),
        }
        .into()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            Err(ApiError::Timeout(format!("{what} failed: {status}")).into())
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ApiError::Auth(format!("{what} failed: {status} {body}")).into())
        }
        _ => Err(ApiError::Api(format!("{what} failed: {status} {body}")).into()),
    }
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .user_agent("studyhub/0.2")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn bearer(&self) -> ApiResult<&str> {
        self.access_token
            .as_deref()
            .ok_or_else(|| ApiError::Auth("no signed-in user".to_string()))
    }
}

#[async_trait]
impl ConnectionsBackend for BackendClient {
    async fn authorize(&self, request: &ConnectionRequest) -> ApiResult<AuthorizationGrant> {
        let token = self.bearer()?;
        with_retry(move || async move {
            let response = self
                .client
                .get(format!("{}/authorize", self.base_url))
                .bearer_auth(token)
                .query(&[
                    ("provider", request.provider.as_str()),
                    ("service", request.service.as_str()),
                ])
                .send()
                .await?;
            let response = check_status(response, "authorize").await?;
            let grant: AuthorizationGrant = response
                .json()
                .await
                .map_err(|e| ApiError::Validation(format!("authorize response: {e}")))?;
            Ok(grant)
        })
        .await
        .map_err(map_anyhow_error)
    }

    async fn list_connections(&self) -> ApiResult<Vec<OAuthConnection>> {
        let token = self.bearer()?;
        let fetch = async {
            let response = self
                .client
                .get(format!("{}/connections", self.base_url))
                .bearer_auth(token)
                .send()
                .await?;
            let response = check_status(response, "list connections").await?;
            let list: ConnectionList = response
                .json()
                .await
                .map_err(|e| ApiError::Validation(format!("connections response: {e}")))?;
            Ok::<Vec<OAuthConnection>, anyhow::Error>(list.into())
        };
        fetch.await.map_err(map_anyhow_error)
    }

    async fn disconnect(&self, request: &ConnectionRequest) -> ApiResult<()> {
        let token = self.bearer()?;
        with_retry(move || async move {
            let response = self
                .client
                .delete(format!(
                    "{}/connections/{}/{}",
                    self.base_url, request.provider, request.service
                ))
                .bearer_auth(token)
                .send()
                .await?;
            check_status(response, "disconnect").await?;
            Ok(())
        })
        .await
        .map_err(map_anyhow_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{bearer_token, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_rate_limit() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<&str, _> = with_retry(move || {
            let attempt_count = attempt_count_clone.clone();
            async move {
                let count = attempt_count.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(anyhow::Error::from(ApiError::RateLimited { retry_after: 1 }))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_auth_errors() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<(), _> = with_retry(move || {
            let attempt_count = attempt_count_clone.clone();
            async move {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::Error::from(ApiError::Auth("connection refused for user".into())))
            }
        })
        .await;

        let err = map_anyhow_error(result.unwrap_err());
        assert!(matches!(err, ApiError::Auth(_)));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_decision_honours_retry_after() {
        let err: anyhow::Error = ApiError::RateLimited { retry_after: 30 }.into();
        assert!(matches!(
            retry_decision(&err),
            RetryDecision::Retry(delay) if delay == Duration::from_secs(30)
        ));
        let err: anyhow::Error = ApiError::Api("500 upstream connection reset".into()).into();
        assert!(matches!(retry_decision(&err), RetryDecision::Fail));
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_non_transient_errors() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<&str, _> = with_retry(move || {
            let attempt_count = attempt_count_clone.clone();
            async move {
                attempt_count.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("unknown provider"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_calculate_backoff_is_capped() {
        let delay = calculate_backoff(20);
        assert!(delay.as_millis() <= MAX_BACKOFF_MS as u128);
    }

    #[tokio::test]
    async fn test_authorize_returns_grant() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/authorize"))
            .and(query_param("provider", "google"))
            .and(query_param("service", "calendar"))
            .and(bearer_token("user-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authorization_url": "https://accounts.example.com/o/oauth2?x=1",
                "state": "opaque-state"
            })))
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri()).with_access_token("user-token");
        let grant = client
            .authorize(&ConnectionRequest::new("google", "calendar"))
            .await
            .unwrap();

        assert_eq!(grant.state, "opaque-state");
        assert_eq!(grant.authorization_url, "https://accounts.example.com/o/oauth2?x=1");
    }

    #[tokio::test]
    async fn test_authorize_without_token_is_auth_error() {
        let client = BackendClient::new("http://127.0.0.1:9");
        let err = client
            .authorize(&ConnectionRequest::new("google", "calendar"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Auth(_)));
    }

    #[tokio::test]
    async fn test_authorize_rejected_pair_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/authorize"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unsupported service"))
            .expect(1)
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri()).with_access_token("t");
        let err = client
            .authorize(&ConnectionRequest::new("google", "fax"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Api(ref msg) if msg.contains("unsupported service")));
    }

    #[tokio::test]
    async fn test_list_connections_accepts_both_shapes() {
        let server = MockServer::start().await;
        let entry = serde_json::json!({
            "provider": "google",
            "service": "calendar",
            "connected": true,
            "user_email": "ada@example.edu",
            "scopes": ["calendar.readonly"]
        });
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([entry])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "connections": [entry] })),
            )
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri()).with_access_token("t");
        let first = client.list_connections().await.unwrap();
        let second = client.list_connections().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].user_email.as_deref(), Some("ada@example.edu"));
    }

    #[tokio::test]
    async fn test_list_connections_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri()).with_access_token("expired");
        let err = client.list_connections().await.unwrap_err();
        assert!(matches!(err, ApiError::Auth(_)));
    }

    #[tokio::test]
    async fn test_list_connections_gateway_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(ResponseTemplate::new(504))
            .expect(1)
            .mount(&server)
            .await;

        let client = BackendClient::new(server.uri()).with_access_token("t");
        let err = client.list_connections().await.unwrap_err();
        assert!(matches!(err, ApiError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_disconnect_sends_delete() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/connections/google/calendar"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = BackendClient::new(format!("{}/", server.uri())).with_access_token("t");
        client
            .disconnect(&ConnectionRequest::new("google", "calendar"))
            .await
            .unwrap();
    }
}
