use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use courier_api::{BoxFuture, CourierError, SubscriptionProbe};

use crate::config::{AuthMode, PubSubConfig};
use crate::subscription::PubSubSubscription;

// ═══════════════════════════════════════════════════════════════
//  Wire types
// ═══════════════════════════════════════════════════════════════

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
    /// Only reported when the subscription has a dead-letter policy.
    #[serde(default)]
    pub delivery_attempt: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubsubMessage {
    /// Base64.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub publish_time: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: &'a [String],
    ack_deadline_seconds: u32,
}

#[derive(Serialize, Deserialize, Default)]
struct Permissions {
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Deserialize)]
struct Empty {}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

// ═══════════════════════════════════════════════════════════════
//  Auth
// ═══════════════════════════════════════════════════════════════

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

struct Auth {
    mode: AuthMode,
    cached: Mutex<Option<CachedToken>>,
}

impl Auth {
    async fn bearer(&self, http: &reqwest::Client) -> Result<Option<String>, CourierError> {
        let url = match &self.mode {
            AuthMode::None => return Ok(None),
            AuthMode::Static(token) => return Ok(Some(token.clone())),
            AuthMode::Metadata(url) => url,
        };

        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if Instant::now() < c.refresh_at {
                return Ok(Some(c.token.clone()));
            }
        }

        // An unreachable or overloaded metadata server is transient.
        let resp = http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| CourierError::io(format!("metadata server: {e}")))?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| CourierError::io(format!("metadata server read: {e}")))?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &String::from_utf8_lossy(&body))
                .with_context("metadata server"));
        }
        let token: MetadataToken = serde_json::from_slice(&body)
            .map_err(|e| CourierError::format(format!("metadata token: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        tracing::debug!(expires_in = token.expires_in, "fetched access token from metadata server");
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(Some(token.access_token))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Status mapping
// ═══════════════════════════════════════════════════════════════

/// Map an unsuccessful HTTP status onto an error kind.
pub fn status_error(status: u16, body: &str) -> CourierError {
    let msg = format!("HTTP {status}: {}", body.trim());
    match status {
        401 | 403 => CourierError::auth(msg),
        404 => CourierError::config(msg),
        408 | 429 | 500..=599 => CourierError::io(msg),
        _ => CourierError::config(msg),
    }
}

// ═══════════════════════════════════════════════════════════════
//  PubSubClient
// ═══════════════════════════════════════════════════════════════

struct Inner {
    http: reqwest::Client,
    base_url: String,
    subscription_path: String,
    auth: Auth,
    max_messages: u32,
    empty_pull_pause: Duration,
    ack_deadline_secs: u32,
    lease_renew_interval: Duration,
}

/// REST client bound to one subscription. Cheap to clone.
#[derive(Clone)]
pub struct PubSubClient {
    inner: Arc<Inner>,
}

impl PubSubClient {
    pub fn new(config: &PubSubConfig) -> Result<Self, CourierError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CourierError::config(format!("HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: config.base_url(),
                subscription_path: config.subscription_path(),
                auth: Auth {
                    mode: config.auth_mode(),
                    cached: Mutex::new(None),
                },
                max_messages: config.max_messages,
                empty_pull_pause: Duration::from_millis(config.empty_pull_pause_ms),
                ack_deadline_secs: config.ack_deadline_secs,
                lease_renew_interval: Duration::from_millis(config.lease_renew_interval_ms),
            }),
        })
    }

    pub fn subscription_path(&self) -> &str {
        &self.inner.subscription_path
    }

    pub(crate) fn empty_pull_pause(&self) -> Duration {
        self.inner.empty_pull_pause
    }

    pub(crate) fn ack_deadline_secs(&self) -> u32 {
        self.inner.ack_deadline_secs
    }

    pub(crate) fn lease_renew_interval(&self) -> Duration {
        self.inner.lease_renew_interval
    }

    /// A receive stream over this subscription.
    pub fn subscribe(&self) -> PubSubSubscription {
        PubSubSubscription::new(self.clone())
    }

    async fn call<Req, Resp>(&self, action: &str, body: &Req) -> Result<Resp, CourierError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = format!(
            "{}/v1/{}:{action}",
            self.inner.base_url, self.inner.subscription_path
        );
        let body = serde_json::to_vec(body)?;

        let mut req = self
            .inner
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(token) = self.inner.auth.bearer(&self.inner.http).await? {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CourierError::io(format!("{action} request: {e}")))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CourierError::io(format!("{action} read: {e}")))?;

        if !status.is_success() {
            return Err(status_error(status.as_u16(), &String::from_utf8_lossy(&bytes))
                .with_context(action));
        }
        let bytes: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        serde_json::from_slice(bytes)
            .map_err(|e| CourierError::format(format!("{action} response: {e}")))
    }

    pub async fn pull(&self) -> Result<Vec<ReceivedMessage>, CourierError> {
        let resp: PullResponse = self
            .call(
                "pull",
                &PullRequest {
                    max_messages: self.inner.max_messages,
                },
            )
            .await?;
        Ok(resp.received_messages)
    }

    pub async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), CourierError> {
        let _: Empty = self
            .call("acknowledge", &AcknowledgeRequest { ack_ids })
            .await?;
        Ok(())
    }

    /// Extends the lease on `ack_ids`. A deadline of zero hands the messages
    /// back for immediate redelivery.
    pub async fn modify_ack_deadline(
        &self,
        ack_ids: &[String],
        ack_deadline_seconds: u32,
    ) -> Result<(), CourierError> {
        let _: Empty = self
            .call(
                "modifyAckDeadline",
                &ModifyAckDeadlineRequest {
                    ack_ids,
                    ack_deadline_seconds,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn test_iam_permissions(
        &self,
        permissions: &[&str],
    ) -> Result<Vec<String>, CourierError> {
        let req = Permissions {
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        };
        let resp: Permissions = self.call("testIamPermissions", &req).await?;
        Ok(resp.permissions)
    }
}

impl SubscriptionProbe for PubSubClient {
    fn test_permissions<'a>(
        &'a self,
        permissions: &'a [&'a str],
    ) -> BoxFuture<'a, Result<Vec<String>, CourierError>> {
        Box::pin(self.test_iam_permissions(permissions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_api::ErrorKind;

    #[test]
    fn statuses_map_to_kinds() {
        assert_eq!(status_error(401, "").kind, ErrorKind::Auth);
        assert_eq!(status_error(403, "").kind, ErrorKind::Auth);
        assert_eq!(status_error(404, "no such subscription").kind, ErrorKind::Config);
        assert_eq!(status_error(429, "").kind, ErrorKind::Io);
        assert_eq!(status_error(503, "").kind, ErrorKind::Io);
        assert_eq!(status_error(400, "bad").kind, ErrorKind::Config);
    }

    #[test]
    fn pull_response_tolerates_missing_fields() {
        let r: PullResponse = serde_json::from_str("{}").unwrap();
        assert!(r.received_messages.is_empty());

        let r: PullResponse = serde_json::from_str(
            r#"{"receivedMessages":[{"ackId":"a1","message":{"data":"aGk=","messageId":"42"}}]}"#,
        )
        .unwrap();
        let m = &r.received_messages[0];
        assert_eq!(m.ack_id, "a1");
        assert_eq!(m.delivery_attempt, 0);
        assert_eq!(m.message.message_id, "42");
        assert!(m.message.attributes.is_empty());
    }

    #[test]
    fn requests_use_camel_case() {
        let ids = vec!["a".to_string()];
        let body = serde_json::to_string(&ModifyAckDeadlineRequest {
            ack_ids: &ids,
            ack_deadline_seconds: 0,
        })
        .unwrap();
        assert_eq!(body, r#"{"ackIds":["a"],"ackDeadlineSeconds":0}"#);
    }
}
