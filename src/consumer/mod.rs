//! Consumer registry
//!
//! Consumers are cursors owned by a stream. Deleting the stream removes
//! its consumers with it.

mod config;

pub use config::*;

use crate::connection::ConnectionManager;
use crate::error::{translate, Boundary, JetStreamError, Result};
use crate::stream::check_name;
use crate::transport::ConsumerAction;
use std::sync::Arc;

/// Consumer management operations
#[derive(Debug, Clone)]
pub struct ConsumerRegistry {
    connection: Arc<ConnectionManager>,
}

impl ConsumerRegistry {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Create a consumer on `stream`
    ///
    /// Creating a durable that already exists with the same configuration
    /// returns it unchanged; a different configuration is a `Conflict`.
    /// The returned info carries the computed starting sequence.
    pub async fn create(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo> {
        check_name(stream)?;
        if let Some(name) = config.consumer_name() {
            check_name(name)?;
        }
        let js = self.connection.jetstream().await?;
        let resource = match config.consumer_name() {
            Some(name) => format!("consumer '{}' on stream '{}'", name, stream),
            None => format!("ephemeral consumer on stream '{}'", stream),
        };

        let info = js
            .transport()
            .create_consumer(stream, config, ConsumerAction::Create)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))?;

        tracing::info!(
            stream = %stream,
            consumer = %info.name,
            filter = ?info.config.filter_subject,
            start_sequence = info.start_sequence(),
            "Consumer created"
        );
        Ok(info)
    }

    /// Apply a partial update over the consumer's current configuration
    pub async fn update(
        &self,
        stream: &str,
        name: &str,
        update: &ConsumerUpdate,
    ) -> Result<ConsumerInfo> {
        check_name(stream)?;
        check_name(name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("consumer '{}' on stream '{}'", name, stream);

        let current = js
            .transport()
            .consumer_info(stream, name)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))?;

        let config = update.apply(current.config);
        let info = js
            .transport()
            .create_consumer(stream, &config, ConsumerAction::Update)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))?;

        tracing::info!(stream = %stream, consumer = %name, "Consumer updated");
        Ok(info)
    }

    /// Delete a consumer; `false` if the stream or consumer did not exist
    pub async fn delete(&self, stream: &str, name: &str) -> Result<bool> {
        check_name(stream)?;
        check_name(name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("consumer '{}' on stream '{}'", name, stream);

        match js.transport().delete_consumer(stream, name).await {
            Ok(()) => {
                tracing::info!(stream = %stream, consumer = %name, "Consumer deleted");
                Ok(true)
            }
            Err(e) => match translate(e, Boundary::Management(&resource)) {
                JetStreamError::NotFound { .. } => Ok(false),
                err => Err(err),
            },
        }
    }

    /// Cursor position and pending counts
    pub async fn info(&self, stream: &str, name: &str) -> Result<ConsumerInfo> {
        check_name(stream)?;
        check_name(name)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("consumer '{}' on stream '{}'", name, stream);

        js.transport()
            .consumer_info(stream, name)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))
    }

    /// Names of all consumers on `stream`
    pub async fn names(&self, stream: &str) -> Result<Vec<String>> {
        check_name(stream)?;
        let js = self.connection.jetstream().await?;
        let resource = format!("stream '{}'", stream);

        js.transport()
            .consumer_names(stream)
            .await
            .map_err(|e| translate(e, Boundary::Management(&resource)))
    }
}
