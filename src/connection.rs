//! Connection manager
//!
//! Owns the single transport session shared by every component. The
//! handshake happens at most once per successful connect: concurrent
//! callers wait on the same handshake, and once the session is ready it
//! is read without taking any lock.

use crate::config::ClientConfig;
use crate::error::{translate, Boundary, JetStreamError, Result};
use crate::transport::{AccountInfo, Connector, Transport};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OnceCell};

/// Lifecycle of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake attempted yet
    Uninitialized,
    /// A handshake is in progress
    Connecting,
    /// The session is established
    Ready,
    /// The last handshake failed; the next call retries
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Uninitialized => write!(f, "uninitialized"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Owns the transport session and the JetStream capability check
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    session: OnceCell<Arc<dyn Transport>>,
    handshake: Mutex<()>,
    state: RwLock<ConnectionState>,
    capability: OnceCell<AccountInfo>,
}

impl ConnectionManager {
    /// Create a manager; nothing connects until the first `session` call
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            session: OnceCell::new(),
            handshake: Mutex::new(()),
            state: RwLock::new(ConnectionState::Uninitialized),
            capability: OnceCell::new(),
        }
    }

    /// Configuration the manager was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Whether the session exists and its transport reports a live connection
    pub fn health(&self) -> bool {
        self.session
            .get()
            .map(|transport| transport.is_connected())
            .unwrap_or(false)
    }

    /// A ready session, connecting first if needed
    ///
    /// Fails with `NotReady` when the handshake fails or the established
    /// connection is currently down.
    pub async fn session(&self) -> Result<Arc<dyn Transport>> {
        let transport = match self.session.get() {
            Some(transport) => transport.clone(),
            None => self.connect().await?,
        };

        if !transport.is_connected() {
            return Err(JetStreamError::NotReady(format!(
                "connection to {} is down",
                self.config.url
            )));
        }
        Ok(transport)
    }

    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let _guard = self.handshake.lock().await;

        // Another caller finished the handshake while we waited
        if let Some(transport) = self.session.get() {
            return Ok(transport.clone());
        }

        self.set_state(ConnectionState::Connecting);
        match self.connector.connect(&self.config).await {
            Ok(transport) => {
                let _ = self.session.set(transport.clone());
                self.set_state(ConnectionState::Ready);
                tracing::info!(url = %self.config.url, "Connection ready");
                Ok(transport)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(url = %self.config.url, error = %reason, "Connection handshake failed");
                self.set_state(ConnectionState::Failed(reason.clone()));
                Err(JetStreamError::NotReady(format!(
                    "failed to connect to {}: {}",
                    self.config.url, reason
                )))
            }
        }
    }

    /// JetStream management handle
    ///
    /// Fails with `CapabilityDisabled` without touching the network when
    /// JetStream is switched off in the configuration. The first successful
    /// call checks the account once to confirm the broker has JetStream.
    pub async fn jetstream(&self) -> Result<JetStream> {
        if !self.config.enable_jetstream {
            return Err(JetStreamError::CapabilityDisabled);
        }

        let transport = self.session().await?;
        self.capability
            .get_or_try_init(|| async {
                let info = transport
                    .account_info()
                    .await
                    .map_err(|e| translate(e, Boundary::Management("account")))?;
                tracing::debug!(
                    streams = info.streams,
                    consumers = info.consumers,
                    "JetStream available"
                );
                Ok::<_, JetStreamError>(info)
            })
            .await?;

        Ok(JetStream {
            transport,
            config: self.config.clone(),
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a ready, JetStream-capable session
#[derive(Clone)]
pub struct JetStream {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
}

impl JetStream {
    /// Live transport behind this handle
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Configuration of the owning connection
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fresh account usage from the broker
    pub async fn account_info(&self) -> Result<AccountInfo> {
        self.transport
            .account_info()
            .await
            .map_err(|e| translate(e, Boundary::Management("account")))
    }
}
