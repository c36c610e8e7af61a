use serde::Deserialize;

use courier_api::CourierError;

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";
pub const DEFAULT_METADATA_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// `[pubsub]` section of the worker config.
#[derive(Clone, Deserialize)]
pub struct PubSubConfig {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub subscription: String,
    /// Explicit API base URL. Wins over `emulator_host`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// `host:port` of a local emulator. Plain HTTP, no credentials.
    #[serde(default)]
    pub emulator_host: Option<String>,
    /// Static bearer token. Without it (and outside the emulator) tokens come
    /// from the metadata server.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    /// `maxMessages` per pull request.
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    /// Upper bound for one HTTP exchange, pull long-polls included.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Pause after a pull that returned nothing.
    #[serde(default = "default_empty_pull_pause_ms")]
    pub empty_pull_pause_ms: u64,
    /// Deadline set on every renewal of an unsettled message's lease.
    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u32,
    /// How often leases are renewed. Must stay below the subscription's own
    /// ack deadline (10 s unless configured otherwise).
    #[serde(default = "default_lease_renew_interval_ms")]
    pub lease_renew_interval_ms: u64,
}

fn default_metadata_url() -> String {
    DEFAULT_METADATA_URL.into()
}
fn default_max_messages() -> u32 {
    100
}
fn default_request_timeout_secs() -> u64 {
    90
}
fn default_empty_pull_pause_ms() -> u64 {
    250
}
fn default_ack_deadline_secs() -> u32 {
    60
}
fn default_lease_renew_interval_ms() -> u64 {
    5_000
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            subscription: String::new(),
            endpoint: None,
            emulator_host: None,
            access_token: None,
            metadata_url: default_metadata_url(),
            max_messages: default_max_messages(),
            request_timeout_secs: default_request_timeout_secs(),
            empty_pull_pause_ms: default_empty_pull_pause_ms(),
            ack_deadline_secs: default_ack_deadline_secs(),
            lease_renew_interval_ms: default_lease_renew_interval_ms(),
        }
    }
}

impl std::fmt::Debug for PubSubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubConfig")
            .field("project", &self.project)
            .field("subscription", &self.subscription)
            .field("endpoint", &self.endpoint)
            .field("emulator_host", &self.emulator_host)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("max_messages", &self.max_messages)
            .field("ack_deadline_secs", &self.ack_deadline_secs)
            .finish_non_exhaustive()
    }
}

/// How requests are authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AuthMode {
    None,
    Static(String),
    Metadata(String),
}

impl PubSubConfig {
    pub fn validate(&self) -> Result<(), CourierError> {
        if self.project.is_empty() {
            return Err(CourierError::config("pubsub.project is required"));
        }
        if self.subscription.is_empty() {
            return Err(CourierError::config("pubsub.subscription is required"));
        }
        if self.max_messages == 0 {
            return Err(CourierError::config("pubsub.max_messages must be at least 1"));
        }
        if !(10..=600).contains(&self.ack_deadline_secs) {
            return Err(CourierError::config(
                "pubsub.ack_deadline_secs must be between 10 and 600",
            ));
        }
        if self.lease_renew_interval_ms == 0
            || self.lease_renew_interval_ms >= u64::from(self.ack_deadline_secs) * 1000
        {
            return Err(CourierError::config(
                "pubsub.lease_renew_interval_ms must be positive and below ack_deadline_secs",
            ));
        }
        Ok(())
    }

    /// `projects/{project}/subscriptions/{subscription}`
    pub fn subscription_path(&self) -> String {
        format!("projects/{}/subscriptions/{}", self.project, self.subscription)
    }

    pub fn base_url(&self) -> String {
        match (&self.endpoint, &self.emulator_host) {
            (Some(endpoint), _) => endpoint.trim_end_matches('/').to_string(),
            (None, Some(host)) => format!("http://{host}"),
            (None, None) => DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub(crate) fn auth_mode(&self) -> AuthMode {
        if let Some(token) = &self.access_token {
            AuthMode::Static(token.clone())
        } else if self.emulator_host.is_some() {
            AuthMode::None
        } else {
            AuthMode::Metadata(self.metadata_url.clone())
        }
    }
}
