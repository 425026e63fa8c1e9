//! Request sender: the outbound half of the correlation engine.
//!
//! A [`MessageSender`] resolves destinations from the model type, encodes
//! bodies through the registry, and supports four call shapes: fire-and-forget
//! send, ephemeral-reply request, caller-supplied-reply request, and
//! transactional pass-through on a caller-owned session. Each call acquires
//! its own connection and releases it unconditionally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{Format, Model, ModelRegistry};
use crate::error::{ClientError, Result};
use crate::future::ReplyFuture;
use crate::message::{Destination, Message, DEFAULT_PRIORITY};
use crate::transport::{
    close_connection_quietly, close_consumer_quietly, close_producer_quietly,
    close_session_quietly, Connection, ConnectionFactory, Session,
};

/// Static configuration for a [`MessageSender`].
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Format for outbound bodies.
    pub format: Format,
    /// Format expected on the reply leg of a request.
    pub response_format: Format,
    /// Default header properties stamped on every outbound message.
    pub properties: HashMap<String, String>,
    /// Default time-to-live; `None` leaves the transport default.
    pub time_to_live: Option<Duration>,
    /// Default delivery priority.
    pub priority: u8,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            format: Format::Xml,
            response_format: Format::Xml,
            properties: HashMap::new(),
            time_to_live: None,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// Per-call overrides for a send. Unset fields fall back to the
/// [`SenderConfig`] defaults.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Header properties for this message, replacing the defaults.
    pub properties: Option<HashMap<String, String>>,
    /// Delivery priority for this message.
    pub priority: Option<u8>,
    /// Marshalling format for this message.
    pub format: Option<Format>,
    /// Time-to-live for this message.
    pub time_to_live: Option<Duration>,
}

/// Sends messages and issues request/reply calls over a queue transport.
pub struct MessageSender {
    factory: Arc<dyn ConnectionFactory>,
    transacted_factory: Option<Arc<dyn ConnectionFactory>>,
    registry: Arc<ModelRegistry>,
    destinations: HashMap<String, Destination>,
    config: SenderConfig,
}

impl MessageSender {
    /// Creates a sender over a connection factory, a model registry, and a
    /// pre-populated destination map (model type name to destination).
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<ModelRegistry>,
        destinations: HashMap<String, Destination>,
        config: SenderConfig,
    ) -> Self {
        Self {
            factory,
            transacted_factory: None,
            registry,
            destinations,
            config,
        }
    }

    /// Configures a separate factory whose connections carry transacted
    /// sessions. When set, plain sends go through it so they can participate
    /// in an externally-managed transaction.
    pub fn with_transacted_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.transacted_factory = Some(factory);
        self
    }

    /// The model registry this sender encodes with.
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Sends a model to the destination mapped from its type name.
    pub async fn send(&self, model: &dyn Model) -> Result<()> {
        let destination = self.resolve_destination(model)?.clone();
        self.send_with(&destination, model, SendOptions::default())
            .await
    }

    /// Sends a model to an explicit destination.
    pub async fn send_to(&self, destination: &Destination, model: &dyn Model) -> Result<()> {
        self.send_with(destination, model, SendOptions::default())
            .await
    }

    /// Sends a model with per-call overrides.
    pub async fn send_with(
        &self,
        destination: &Destination,
        model: &dyn Model,
        options: SendOptions,
    ) -> Result<()> {
        let format = options.format.unwrap_or(self.config.format);
        let body = self.registry.encode(format, model)?;
        debug!(model = ?model, destination = %destination, "sending object");
        let ttl = options.time_to_live.or(self.config.time_to_live);
        let message = self.build_message(body, &options);
        self.publish(destination, message, ttl).await
    }

    /// Publishes a pre-built message as-is. Used by the inbound dispatcher's
    /// reply leg; goes through the non-transacted factory unconditionally.
    /// A per-message time-to-live overrides the configured default.
    pub async fn send_message(
        &self,
        destination: &Destination,
        message: Message,
        time_to_live: Option<Duration>,
    ) -> Result<()> {
        let time_to_live = time_to_live.or(self.config.time_to_live);
        let connection = self.factory.create_connection().await?;
        let outcome = self
            .send_on(&*connection, false, destination, message, time_to_live)
            .await;
        close_connection_quietly(&*connection).await;
        outcome
    }

    /// Sends a model on a caller-owned session.
    ///
    /// Transactional pass-through: the caller controls the transaction
    /// boundary (commit/rollback); the sender only produces into it.
    pub async fn send_with_session(
        &self,
        session: &dyn Session,
        model: &dyn Model,
    ) -> Result<()> {
        let destination = self.resolve_destination(model)?.clone();
        let body = self.registry.encode(self.config.format, model)?;
        debug!(model = ?model, destination = %destination, "sending object in caller session");
        let message = self.build_message(body, &SendOptions::default());
        self.produce(session, &destination, message, self.config.time_to_live)
            .await
    }

    /// Issues a request and waits for the correlated reply on a fresh
    /// temporary destination. The reply channel is torn down on every exit
    /// path, timeout and cancellation included.
    pub async fn request<T>(&self, model: &dyn Model, timeout: Duration) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let future = self.async_request::<T>(model).await?;
        let outcome = future.await_timeout(timeout).await;
        // close failures are logged inside close(); the call outcome wins
        let _ = future.close().await;
        outcome
    }

    /// Issues a request whose reply arrives on a caller-supplied destination
    /// instead of a fresh temporary one.
    pub async fn request_with_reply_to<T>(
        &self,
        reply_to: &Destination,
        model: &dyn Model,
        timeout: Duration,
    ) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let future = self.open_request::<T>(model, Some(reply_to)).await?;
        let outcome = future.await_timeout(timeout).await;
        let _ = future.close().await;
        outcome
    }

    /// Issues a request and returns the pending reply as a future.
    ///
    /// The caller awaits the result and must close the future to release its
    /// consumer, session, and connection.
    pub async fn async_request<T>(&self, model: &dyn Model) -> Result<ReplyFuture<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.open_request(model, None).await
    }

    async fn open_request<T>(
        &self,
        model: &dyn Model,
        reply_override: Option<&Destination>,
    ) -> Result<ReplyFuture<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let destination = self.resolve_destination(model)?.clone();
        let body = self.registry.encode(self.config.format, model)?;
        debug!(model = ?model, destination = %destination, "sending request");

        let connection = self.factory.create_connection().await?;
        let setup = async {
            let session = connection.create_session(false).await?;
            connection.start().await?;
            let reply_to = match reply_override {
                Some(destination) => destination.clone(),
                None => session.create_temporary_queue().await?,
            };
            let consumer = session.create_consumer(&reply_to, None).await?;
            Ok::<_, ClientError>((session, reply_to, consumer))
        }
        .await;
        let (session, reply_to, consumer) = match setup {
            Ok(bound) => bound,
            Err(e) => {
                close_connection_quietly(&*connection).await;
                return Err(e);
            }
        };

        let correlation_id = Uuid::new_v4().to_string();
        let mut message = self.build_message(body, &SendOptions::default());
        message.correlation_id = Some(correlation_id);
        message.reply_to = Some(reply_to);
        let sent = self
            .produce(&*session, &destination, message, self.config.time_to_live)
            .await;
        if let Err(e) = sent {
            close_consumer_quietly(&*consumer).await;
            close_session_quietly(&*session).await;
            close_connection_quietly(&*connection).await;
            return Err(e);
        }

        let registry = self.registry.clone();
        let response_format = self.config.response_format;
        Ok(ReplyFuture::new(connection, session, consumer, move |text| {
            registry.decode_as::<T>(response_format, text)
        }))
    }

    fn resolve_destination(&self, model: &dyn Model) -> Result<&Destination> {
        let name = self.registry.name_of(model).ok_or_else(|| {
            ClientError::config(format!(
                "no destination mapping for unregistered type of value [{model:?}]"
            ))
        })?;
        self.destinations.get(name).ok_or_else(|| {
            ClientError::config(format!("no destination found for key [{name}]"))
        })
    }

    fn build_message(&self, body: String, options: &SendOptions) -> Message {
        let mut message = Message::text(body);
        message.properties = options
            .properties
            .clone()
            .unwrap_or_else(|| self.config.properties.clone());
        message.priority = options.priority.unwrap_or(self.config.priority);
        message
    }

    async fn publish(
        &self,
        destination: &Destination,
        message: Message,
        time_to_live: Option<Duration>,
    ) -> Result<()> {
        let (factory, transacted) = match &self.transacted_factory {
            Some(factory) => (factory, true),
            None => (&self.factory, false),
        };
        let connection = factory.create_connection().await?;
        let outcome = self
            .send_on(&*connection, transacted, destination, message, time_to_live)
            .await;
        close_connection_quietly(&*connection).await;
        outcome
    }

    async fn send_on(
        &self,
        connection: &dyn Connection,
        transacted: bool,
        destination: &Destination,
        message: Message,
        time_to_live: Option<Duration>,
    ) -> Result<()> {
        let session = connection.create_session(transacted).await?;
        let mut outcome = self
            .produce(&*session, destination, message, time_to_live)
            .await;
        if outcome.is_ok() && transacted {
            // the send owns this short-lived scope, so it also completes it
            outcome = session.commit().await;
        }
        close_session_quietly(&*session).await;
        outcome
    }

    async fn produce(
        &self,
        session: &dyn Session,
        destination: &Destination,
        message: Message,
        time_to_live: Option<Duration>,
    ) -> Result<()> {
        let producer = session.create_producer(destination).await?;
        let outcome = producer.send(message, time_to_live).await;
        close_producer_quietly(&*producer).await;
        outcome
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("destinations", &self.destinations)
            .field("config", &self.config)
            .finish()
    }
}
