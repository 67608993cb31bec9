//! Token validation gate.
//!
//! The relay never interprets tokens. It asks a [`TokenValidator`] for a
//! [`Verdict`] and only admits a connection on `Valid` with a matching
//! identity. `Unreachable` is retried a bounded number of times and then
//! fails closed.

use crate::error::AuthFailure;
use crate::protocol::ConnectRequest;
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of validating a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Token is valid and authorizes `identity`.
    Valid { identity: String },
    /// Token was explicitly rejected. Terminal.
    Invalid,
    /// The authority could not be reached (timeout or transport failure).
    Unreachable,
}

/// External authority that validates access tokens.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    /// Validate a token. Implementations must map transport failures to
    /// `Unreachable`, never to `Invalid`.
    async fn validate(&self, token: &str) -> Verdict;
}

/// Retry and timeout policy for validation.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Per-attempt timeout; expiry counts as `Unreachable`.
    pub timeout: Duration,
    /// Extra attempts after the first `Unreachable`.
    pub max_retries: u32,
    /// Delay before the first retry, doubled after each.
    pub retry_backoff: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Applies the validation policy to a connection request.
pub struct Authenticator {
    validator: Arc<dyn TokenValidator>,
    config: AuthConfig,
}

impl Authenticator {
    pub fn new(validator: Arc<dyn TokenValidator>, config: AuthConfig) -> Self {
        Self { validator, config }
    }

    /// Authenticate a request, returning the admitted user identifier.
    pub async fn authenticate(&self, request: &ConnectRequest) -> Result<String, AuthFailure> {
        let (user_id, token) = request.credentials()?;
        let attempts = self.config.max_retries + 1;
        let mut backoff = self.config.retry_backoff;

        for attempt in 1..=attempts {
            let verdict = tokio::time::timeout(self.config.timeout, self.validator.validate(token))
                .await
                .unwrap_or(Verdict::Unreachable);

            match verdict {
                Verdict::Valid { identity } if identity == user_id => return Ok(identity),
                Verdict::Valid { identity } => {
                    debug!("Token for {} authorizes {}", user_id, identity);
                    return Err(AuthFailure::IdentityMismatch);
                }
                Verdict::Invalid => return Err(AuthFailure::InvalidToken),
                Verdict::Unreachable => {
                    counter!("relay_validator_unreachable_total").increment(1);
                    warn!(
                        "Token validator unreachable for {} (attempt {}/{})",
                        user_id, attempt, attempts
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(AuthFailure::ValidatorUnreachable { attempts })
    }
}

// ============================================================================
// HTTP validator
// ============================================================================

#[derive(Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default, alias = "userId", alias = "identity")]
    user_id: Option<String>,
}

/// Validator calling an HTTP verification endpoint.
///
/// `POST {url}` with `{"token": "..."}`:
/// - 2xx `{"valid": true, "user_id": "..."}` → `Valid`
/// - 2xx `{"valid": false}`, 401, 403 → `Invalid`
/// - anything else, transport errors, unparseable bodies → `Unreachable`
#[derive(Clone)]
pub struct HttpTokenValidator {
    http_client: reqwest::Client,
    url: String,
}

impl HttpTokenValidator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn validate(&self, token: &str) -> Verdict {
        let response = match self
            .http_client
            .post(&self.url)
            .json(&VerifyRequest { token })
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!("Validator request failed: {}", e);
                return Verdict::Unreachable;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Verdict::Invalid;
        }
        if !status.is_success() {
            debug!("Validator returned {}", status);
            return Verdict::Unreachable;
        }

        match response.json::<VerifyResponse>().await {
            Ok(VerifyResponse {
                valid: true,
                user_id: Some(identity),
            }) if !identity.is_empty() => Verdict::Valid { identity },
            Ok(_) => Verdict::Invalid,
            Err(e) => {
                debug!("Validator response unreadable: {}", e);
                Verdict::Unreachable
            }
        }
    }
}

// ============================================================================
// Static validator
// ============================================================================

/// Fixed token → identity table, for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), identity.into());
        self
    }

    /// Parse `token:user,token:user`. Returns `None` on a malformed entry.
    pub fn parse(pairs: &str) -> Option<Self> {
        let mut validator = Self::new();
        for entry in pairs.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, identity) = entry.split_once(':')?;
            if token.is_empty() || identity.is_empty() {
                return None;
            }
            validator = validator.with_token(token, identity);
        }
        Some(validator)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Verdict {
        match self.tokens.get(token) {
            Some(identity) => Verdict::Valid {
                identity: identity.clone(),
            },
            None => Verdict::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns scripted verdicts in order, then `Unreachable`.
    struct ScriptedValidator {
        verdicts: Mutex<VecDeque<Verdict>>,
        calls: AtomicUsize,
    }

    impl ScriptedValidator {
        fn new(verdicts: Vec<Verdict>) -> Arc<Self> {
            Arc::new(Self {
                verdicts: Mutex::new(verdicts.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TokenValidator for ScriptedValidator {
        async fn validate(&self, _token: &str) -> Verdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdicts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Verdict::Unreachable)
        }
    }

    struct SlowValidator;

    #[async_trait]
    impl TokenValidator for SlowValidator {
        async fn validate(&self, _token: &str) -> Verdict {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Verdict::Valid {
                identity: "alice".into(),
            }
        }
    }

    fn fast_config(max_retries: u32) -> AuthConfig {
        AuthConfig {
            timeout: Duration::from_millis(50),
            max_retries,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn valid(identity: &str) -> Verdict {
        Verdict::Valid {
            identity: identity.to_string(),
        }
    }

    #[tokio::test]
    async fn test_valid_token() {
        let validator = ScriptedValidator::new(vec![valid("alice")]);
        let auth = Authenticator::new(validator.clone(), fast_config(2));

        let result = auth.authenticate(&ConnectRequest::new("alice", "tok")).await;
        assert_eq!(result, Ok("alice".to_string()));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_is_terminal() {
        let validator = ScriptedValidator::new(vec![Verdict::Invalid, valid("bob")]);
        let auth = Authenticator::new(validator.clone(), fast_config(2));

        let result = auth.authenticate(&ConnectRequest::new("bob", "tok")).await;
        assert_eq!(result, Err(AuthFailure::InvalidToken));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_is_retried() {
        let validator =
            ScriptedValidator::new(vec![Verdict::Unreachable, Verdict::Unreachable, valid("alice")]);
        let auth = Authenticator::new(validator.clone(), fast_config(2));

        let result = auth.authenticate(&ConnectRequest::new("alice", "tok")).await;
        assert_eq!(result, Ok("alice".to_string()));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_fails_closed() {
        let validator = ScriptedValidator::new(vec![]);
        let auth = Authenticator::new(validator.clone(), fast_config(2));

        let result = auth.authenticate(&ConnectRequest::new("alice", "tok")).await;
        assert_eq!(result, Err(AuthFailure::ValidatorUnreachable { attempts: 3 }));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_unreachable() {
        let auth = Authenticator::new(Arc::new(SlowValidator), fast_config(0));
        let result = auth.authenticate(&ConnectRequest::new("alice", "tok")).await;
        assert_eq!(result, Err(AuthFailure::ValidatorUnreachable { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_identity_mismatch() {
        let validator = ScriptedValidator::new(vec![valid("mallory")]);
        let auth = Authenticator::new(validator, fast_config(0));

        let result = auth.authenticate(&ConnectRequest::new("alice", "tok")).await;
        assert_eq!(result, Err(AuthFailure::IdentityMismatch));
    }

    #[tokio::test]
    async fn test_missing_credentials_skip_validator() {
        let validator = ScriptedValidator::new(vec![valid("alice")]);
        let auth = Authenticator::new(validator.clone(), fast_config(0));

        let result = auth.authenticate(&ConnectRequest::default()).await;
        assert_eq!(result, Err(AuthFailure::MissingUserId));
        assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_static_validator() {
        let validator = StaticTokenValidator::parse("t1:alice, t2:bob").unwrap();
        assert_eq!(validator.len(), 2);
        assert_eq!(validator.validate("t1").await, valid("alice"));
        assert_eq!(validator.validate("nope").await, Verdict::Invalid);

        assert!(StaticTokenValidator::parse("missing-colon").is_none());
        assert!(StaticTokenValidator::parse(":alice").is_none());
    }

    #[tokio::test]
    async fn test_http_validator_verdicts() {
        use axum::{http::StatusCode, routing::post, Json, Router};

        async fn verify(Json(body): Json<serde_json::Value>) -> axum::response::Response {
            use axum::response::IntoResponse;
            match body["token"].as_str() {
                Some("good") => Json(serde_json::json!({"valid": true, "user_id": "alice"}))
                    .into_response(),
                Some("rejected") => Json(serde_json::json!({"valid": false})).into_response(),
                Some("forbidden") => StatusCode::FORBIDDEN.into_response(),
                _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/verify", post(verify)))
                .await
                .unwrap();
        });

        let validator =
            HttpTokenValidator::new(format!("http://{}/verify", addr), Duration::from_secs(2))
                .unwrap();
        assert_eq!(validator.validate("good").await, valid("alice"));
        assert_eq!(validator.validate("rejected").await, Verdict::Invalid);
        assert_eq!(validator.validate("forbidden").await, Verdict::Invalid);
        assert_eq!(validator.validate("boom").await, Verdict::Unreachable);

        let unreachable =
            HttpTokenValidator::new("http://127.0.0.1:9/verify", Duration::from_millis(200))
                .unwrap();
        assert_eq!(unreachable.validate("good").await, Verdict::Unreachable);
    }
}
