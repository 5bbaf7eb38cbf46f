//! Client configuration
//!
//! Passed explicitly to the connection manager; nothing is read from a
//! global container. `from_env()` overlays the usual `NATS_*` variables.

use crate::error::{JetStreamError, Result};
use crate::message::Headers;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default NATS server URL
pub const DEFAULT_URL: &str = "nats://localhost:4222";

/// Default publish acknowledgement timeout
pub const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 10;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,

    /// Whether streaming (JetStream) operations are allowed at all
    pub enable_jetstream: bool,

    /// Client name reported to the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Authentication token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Username for user/password authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password for user/password authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Timeout for management requests in seconds
    pub request_timeout_secs: u64,

    /// Default publish acknowledgement timeout in seconds
    pub publish_timeout_secs: u64,

    /// JetStream domain (`$JS.<domain>.API`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Explicit JetStream API prefix, overrides `domain`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_prefix: Option<String>,

    /// Headers added to every published message unless the caller overrides them
    #[serde(skip_serializing_if = "Headers::is_empty")]
    pub default_headers: Headers,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            enable_jetstream: true,
            name: None,
            token: None,
            user: None,
            password: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 5,
            publish_timeout_secs: DEFAULT_PUBLISH_TIMEOUT_SECS,
            domain: None,
            api_prefix: None,
            default_headers: Headers::new(),
        }
    }
}

impl ClientConfig {
    /// Create a config for the given URL with defaults for everything else
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Defaults overlaid with `NATS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Overlay `NATS_URL`, `NATS_ENABLE_JETSTREAM`, `NATS_TOKEN`, `NATS_USER`,
    /// `NATS_PASSWORD`, `NATS_DOMAIN` and `NATS_NAME` onto this config
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = var("NATS_URL") {
            self.url = url;
        }
        if let Some(flag) = var("NATS_ENABLE_JETSTREAM") {
            self.enable_jetstream = parse_bool(&flag).ok_or_else(|| {
                JetStreamError::Config(format!(
                    "NATS_ENABLE_JETSTREAM must be true/false, got '{}'",
                    flag
                ))
            })?;
        }
        if let Some(token) = var("NATS_TOKEN") {
            self.token = Some(token);
        }
        if let Some(user) = var("NATS_USER") {
            self.user = Some(user);
        }
        if let Some(password) = var("NATS_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(domain) = var("NATS_DOMAIN") {
            self.domain = Some(domain);
        }
        if let Some(name) = var("NATS_NAME") {
            self.name = Some(name);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations that can never work
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(JetStreamError::Config("url must not be empty".to_string()));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(JetStreamError::Config(
                "connect and request timeouts must be greater than zero".to_string(),
            ));
        }
        if self.publish_timeout_secs == 0 {
            return Err(JetStreamError::Config(
                "publish timeout must be greater than zero".to_string(),
            ));
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(JetStreamError::Config(
                "user and password must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// JetStream API subject prefix
    pub fn api_prefix(&self) -> String {
        match (&self.api_prefix, &self.domain) {
            (Some(prefix), _) => prefix.trim_end_matches('.').to_string(),
            (None, Some(domain)) => format!("$JS.{}.API", domain),
            (None, None) => "$JS.API".to_string(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
