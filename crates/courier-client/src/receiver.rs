//! Synchronous pull-style consumption: single receive, selected receive,
//! batch drain and non-destructive browse.
//!
//! Each call opens its own connection, session and consumer and closes them
//! in reverse order before returning; nothing is pooled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::codec::{Decoded, Format, ModelRegistry};
use crate::error::{ClientError, Result};
use crate::message::Destination;
use crate::selector::build_selector;
use crate::transport::{
    close_connection_quietly, close_consumer_quietly, close_session_quietly, Connection,
    ConnectionFactory, Consumer,
};

/// Static configuration for a [`MessageReceiver`].
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Format inbound bodies are decoded with.
    pub format: Format,
    /// How long a single receive waits for a message before giving up.
    pub receive_timeout: Duration,
    /// When true, a batch receive fails outright on the first bad message;
    /// when false, it returns the messages decoded so far.
    pub batch_fail_fast: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            format: Format::Xml,
            receive_timeout: Duration::from_secs(1),
            batch_fail_fast: true,
        }
    }
}

/// Pulls messages off a destination and decodes them into models.
pub struct MessageReceiver {
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<ModelRegistry>,
    config: ReceiverConfig,
}

impl MessageReceiver {
    /// Creates a receiver over a connection factory and a model registry.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<ModelRegistry>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            factory,
            registry,
            config,
        }
    }

    /// Receives one message and decodes it into whatever registered type the
    /// body describes. Returns `None` when the timeout elapses quietly.
    pub async fn receive(&self, destination: &Destination) -> Result<Option<Decoded>> {
        self.with_consumer(destination, None, |consumer| async move {
            match consumer.recv(Some(self.config.receive_timeout)).await? {
                Some(message) => {
                    let decoded = self.registry.decode(self.config.format, message.text_body()?)?;
                    Ok(Some(decoded))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Receives one message and decodes it as `T`.
    pub async fn receive_as<T>(&self, destination: &Destination) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.receive_selected_as(destination, &HashMap::new()).await
    }

    /// Receives one message matching the given property map and decodes it
    /// as `T`. An empty map means no filtering.
    pub async fn receive_selected_as<T>(
        &self,
        destination: &Destination,
        properties: &HashMap<String, String>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let selector = build_selector(properties);
        self.with_consumer(destination, selector.as_deref(), |consumer| async move {
            match consumer.recv(Some(self.config.receive_timeout)).await? {
                Some(message) => {
                    let value = self
                        .registry
                        .decode_as::<T>(self.config.format, message.text_body()?)?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Drains up to `batch_size` messages matching the property map.
    ///
    /// Stops early when the per-message timeout elapses with the queue empty.
    /// A message that fails to decode either fails the whole batch or ends it
    /// with the messages decoded so far, per `batch_fail_fast`.
    pub async fn receive_batch_as<T>(
        &self,
        destination: &Destination,
        properties: &HashMap<String, String>,
        batch_size: usize,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if batch_size == 0 {
            return Err(ClientError::config("batch size must be at least 1"));
        }
        let selector = build_selector(properties);
        self.with_consumer(destination, selector.as_deref(), |consumer| async move {
            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                let Some(message) = consumer.recv(Some(self.config.receive_timeout)).await? else {
                    debug!(received = batch.len(), "batch receive timed out");
                    break;
                };
                let decoded = message
                    .text_body()
                    .and_then(|text| self.registry.decode_as::<T>(self.config.format, text));
                match decoded {
                    Ok(value) => batch.push(value),
                    Err(e) if self.config.batch_fail_fast => return Err(e),
                    Err(e) => {
                        warn!(error = %e, received = batch.len(), "stopping batch on bad message");
                        break;
                    }
                }
            }
            Ok(batch)
        })
        .await
    }

    /// Non-destructively decodes every message currently on a queue that
    /// matches the property map. Messages without a text body are skipped.
    pub async fn browse_as<T>(
        &self,
        queue: &Destination,
        properties: &HashMap<String, String>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let selector = build_selector(properties);
        let connection = self.factory.create_connection().await?;
        let outcome = self.browse_on(&*connection, queue, selector.as_deref()).await;
        close_connection_quietly(&*connection).await;
        outcome
    }

    async fn browse_on<T>(
        &self,
        connection: &dyn Connection,
        queue: &Destination,
        selector: Option<&str>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let session = connection.create_session(false).await?;
        let outcome = async {
            let snapshot = session.browse(queue, selector).await?;
            let mut values = Vec::with_capacity(snapshot.len());
            for message in &snapshot {
                let Ok(text) = message.text_body() else {
                    continue;
                };
                values.push(self.registry.decode_as::<T>(self.config.format, text)?);
            }
            Ok(values)
        }
        .await;
        close_session_quietly(&*session).await;
        outcome
    }

    /// Opens connection, session and consumer, runs `f` against the consumer,
    /// then closes everything in reverse order regardless of the outcome.
    async fn with_consumer<'a, T, F, Fut>(
        &'a self,
        destination: &'a Destination,
        selector: Option<&'a str>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn Consumer>) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + 'a,
    {
        let connection = self.factory.create_connection().await?;
        let outcome = async {
            let session = connection.create_session(false).await?;
            let outcome = async {
                connection.start().await?;
                let consumer = session.create_consumer(destination, selector).await?;
                let outcome = f(consumer.clone()).await;
                close_consumer_quietly(&*consumer).await;
                outcome
            }
            .await;
            close_session_quietly(&*session).await;
            outcome
        }
        .await;
        close_connection_quietly(&*connection).await;
        outcome
    }
}
