//! Stream registry
//!
//! Create, update, delete and inspect streams. Every call is a fresh
//! round trip; nothing about remote streams is cached locally.

mod config;

pub use config::*;

use crate::connection::ConnectionManager;
use crate::error::{is_stream_config_conflict, translate, Boundary, JetStreamError, Result};
use crate::transport::subject;
use std::sync::Arc;

/// Reject names that cannot be used as an API subject token
pub(crate) fn check_name(name: &str) -> Result<()> {
    subject::validate_name(name).map_err(|reason| JetStreamError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// Stream management operations
#[derive(Debug, Clone)]
pub struct StreamRegistry {
    connection: Arc<ConnectionManager>,
}

impl StreamRegistry {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Create a stream; an existing stream with a different configuration is a `Conflict`
    pub async fn create(&self, config: &StreamConfig) -> Result<StreamInfo> {
        check_name(&config.name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("stream '{}'", config.name);

        let info = js
            .transport()
            .create_stream(config)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))?;

        tracing::info!(
            stream = %config.name,
            subjects = ?info.config.subjects,
            "Stream created"
        );
        Ok(info)
    }

    /// Create a stream, or update it in place when it exists with a different configuration
    ///
    /// The update path is taken only when `spec.autoupdate` is set; otherwise
    /// the conflict is returned and the existing stream is left untouched.
    /// Calling this twice with the same spec is a no-op the second time.
    pub async fn create_or_update(&self, spec: &StreamSpec) -> Result<StreamInfo> {
        let config = &spec.config;
        check_name(&config.name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("stream '{}'", config.name);

        match js.transport().create_stream(config).await {
            Ok(info) => {
                tracing::info!(stream = %config.name, "Stream ready");
                Ok(info)
            }
            Err(e) => {
                let err = translate(e, Boundary::Management(&resource));
                if !(spec.autoupdate && is_stream_config_conflict(&err)) {
                    return Err(err);
                }

                tracing::info!(
                    stream = %config.name,
                    "Stream exists with a different configuration, updating"
                );
                js.transport()
                    .update_stream(config)
                    .await
                    .map_err(|e| translate(e, Boundary::Management(&resource)))
            }
        }
    }

    /// Apply a partial update over the stream's current configuration
    pub async fn update(&self, name: &str, update: &StreamUpdate) -> Result<StreamInfo> {
        check_name(name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("stream '{}'", name);

        let current = js
            .transport()
            .stream_info(name, &StreamInfoOptions::default())
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))?;
        if update.is_empty() {
            return Ok(current);
        }

        let config = update.apply(current.config);
        let info = js
            .transport()
            .update_stream(&config)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))?;

        tracing::info!(stream = %name, "Stream updated");
        Ok(info)
    }

    /// Delete a stream and its consumers; `false` if there was nothing to delete
    pub async fn delete(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("stream '{}'", name);

        match js.transport().delete_stream(name).await {
            Ok(()) => {
                tracing::info!(stream = %name, "Stream deleted");
                Ok(true)
            }
            Err(e) => match translate(e, Boundary::Management(&resource)) {
                err if err.is_not_found() => Ok(false),
                err => Err(err),
            },
        }
    }

    /// Current configuration and state
    pub async fn info(&self, name: &str, options: &StreamInfoOptions) -> Result<StreamInfo> {
        check_name(name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("stream '{}'", name);

        js.transport()
            .stream_info(name, options)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))
    }

    /// Remove messages, optionally only those on subjects matching `filter`
    pub async fn purge(&self, name: &str, filter: Option<&str>) -> Result<u64> {
        check_name(name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("stream '{}'", name);

        let purged = js
            .transport()
            .purge_stream(name, filter)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))?;

        tracing::info!(stream = %name, filter = ?filter, purged, "Stream purged");
        Ok(purged)
    }

    /// Names of all streams
    pub async fn names(&self) -> Result<Vec<String>> {
        let js = self.connection.jetstream().await?;
        js.transport()
            .stream_names()
            .await
            .map_err(|e| translate(e, Boundary::Management("streams")))
    }
}
