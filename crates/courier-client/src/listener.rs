//! Inbound dispatch: decode, typed handler lookup, invoke, reply routing.
//!
//! The dispatcher is the receiving half of the correlation engine. It decodes
//! an inbound message, resolves the in-process handler registered for the
//! decoded type, invokes it, and — when the message carried reply-to and
//! correlation metadata — routes the handler's result back to the caller with
//! correlation, properties, and remaining lifetime preserved.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{short_type_name, Format, Model, ModelRegistry};
use crate::error::{ClientError, Result};
use crate::message::{Destination, Message};
use crate::sender::MessageSender;
use crate::transport::Consumer;

/// A typed in-process handler for one inbound model type.
///
/// Returning `Ok(None)` makes the handler fire-and-forget: no reply is sent
/// even when the inbound message requested one.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// The inbound model type this handler consumes.
    type Request: Send + 'static;
    /// The result type sent back on the reply leg.
    type Reply: Debug + Send + Sync + 'static;

    /// Handles one decoded request. `properties` is populated only when the
    /// dispatcher is configured with `properties_required`.
    async fn handle(
        &self,
        request: Self::Request,
        properties: Option<&HashMap<String, String>>,
    ) -> Result<Option<Self::Reply>>;
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn call(
        &self,
        request: Box<dyn Any + Send>,
        properties: Option<&HashMap<String, String>>,
    ) -> Result<Option<Box<dyn Model>>>;
}

struct HandlerAdapter<H>(H);

#[async_trait]
impl<H: RequestHandler> ErasedHandler for HandlerAdapter<H> {
    async fn call(
        &self,
        request: Box<dyn Any + Send>,
        properties: Option<&HashMap<String, String>>,
    ) -> Result<Option<Box<dyn Model>>> {
        let request = request.downcast::<H::Request>().map_err(|_| {
            ClientError::marshal(format!(
                "handler for [{}] received a value of another type",
                short_type_name::<H::Request>()
            ))
        })?;
        let reply = self.0.handle(*request, properties).await?;
        Ok(reply.map(|r| Box::new(r) as Box<dyn Model>))
    }
}

/// Type-keyed mapping from inbound model type name to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, keyed by its request type's short name.
    ///
    /// At most one handler exists per type: registering a second handler for
    /// the same request type replaces the first (last registration wins).
    pub fn register<H: RequestHandler>(mut self, handler: H) -> Self {
        let name = short_type_name::<H::Request>().to_string();
        self.handlers.insert(name, Arc::new(HandlerAdapter(handler)));
        self
    }

    fn get(&self, type_name: &str) -> Option<&Arc<dyn ErasedHandler>> {
        self.handlers.get(type_name)
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Static configuration for a [`MessageDispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Format inbound bodies are decoded with.
    pub format: Format,
    /// Format handler results are encoded with on the reply leg.
    pub response_format: Format,
    /// Pass the inbound property map to handlers.
    pub properties_required: bool,
    /// Route replies here instead of the inbound reply-to address.
    pub reply_to_override: Option<Destination>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            format: Format::Xml,
            response_format: Format::Xml,
            properties_required: false,
            reply_to_override: None,
        }
    }
}

/// Dispatches inbound messages to registered handlers and routes results
/// back to the requester.
pub struct MessageDispatcher {
    registry: Arc<ModelRegistry>,
    handlers: HandlerRegistry,
    sender: Arc<MessageSender>,
    config: DispatcherConfig,
}

impl MessageDispatcher {
    /// Creates a dispatcher. The sender is used for the reply leg only.
    pub fn new(
        registry: Arc<ModelRegistry>,
        handlers: HandlerRegistry,
        sender: Arc<MessageSender>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            handlers,
            sender,
            config,
        }
    }

    /// Processes one inbound message.
    ///
    /// Non-text payloads, decode failures, and missing handlers are raised to
    /// the caller so the surrounding transport integration can apply its own
    /// redelivery or dead-letter policy; no retry happens here. A failure to
    /// deliver the reply after successful handling is logged and swallowed.
    pub async fn dispatch(&self, message: &Message) -> Result<()> {
        let text = message.text_body()?;
        let decoded = self.registry.decode(self.config.format, text)?;
        let handler = self.handlers.get(&decoded.type_name).ok_or_else(|| {
            ClientError::config(format!(
                "no handler found for key [{}]",
                decoded.type_name
            ))
        })?;

        let properties = self
            .config
            .properties_required
            .then_some(&message.properties);
        let reply = handler.call(decoded.value, properties).await?;

        if let Some(reply) = reply {
            if let (Some(correlation_id), Some(reply_to)) =
                (&message.correlation_id, &message.reply_to)
            {
                if let Err(e) = self
                    .send_reply(&*reply, message, correlation_id, reply_to)
                    .await
                {
                    warn!(error = %e, "could not send to reply destination");
                }
            }
        }
        Ok(())
    }

    /// Runs a serve loop over a consumer: receive, dispatch, log failures,
    /// continue. Stops when the consumer is closed.
    pub fn spawn_listener(self: Arc<Self>, consumer: Arc<dyn Consumer>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match consumer.recv(None).await {
                    Ok(Some(message)) => {
                        if let Err(e) = self.dispatch(&message).await {
                            warn!(error = %e, "message dispatch failed");
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(error = %e, "listener consumer closed");
                        break;
                    }
                }
            }
        })
    }

    async fn send_reply(
        &self,
        reply: &dyn Model,
        inbound: &Message,
        correlation_id: &str,
        reply_to: &Destination,
    ) -> Result<()> {
        let body = self.registry.encode(self.config.response_format, reply)?;
        let mut outbound = Message::text(body);
        // every inbound header property travels back verbatim
        outbound.properties = inbound.properties.clone();
        outbound.correlation_id = Some(correlation_id.to_string());
        outbound.reply_to = Some(reply_to.clone());
        let target = self.config.reply_to_override.as_ref().unwrap_or(reply_to);
        // an inbound expiration caps the reply; otherwise the sender's
        // configured default applies
        let time_to_live = inbound.remaining_lifetime();
        self.sender
            .send_message(target, outbound, time_to_live)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::sender::SenderConfig;
    use crate::transport::ConnectionFactory;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        id: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderAck {
        id: u64,
        status: String,
    }

    struct AckHandler;

    #[async_trait]
    impl RequestHandler for AckHandler {
        type Request = OrderCreated;
        type Reply = OrderAck;

        async fn handle(
            &self,
            request: OrderCreated,
            _properties: Option<&HashMap<String, String>>,
        ) -> Result<Option<OrderAck>> {
            Ok(Some(OrderAck {
                id: request.id,
                status: "OK".to_string(),
            }))
        }
    }

    struct SilentHandler;

    #[async_trait]
    impl RequestHandler for SilentHandler {
        type Request = OrderCreated;
        type Reply = OrderAck;

        async fn handle(
            &self,
            _request: OrderCreated,
            _properties: Option<&HashMap<String, String>>,
        ) -> Result<Option<OrderAck>> {
            Ok(None)
        }
    }

    struct PropertyEchoHandler;

    #[async_trait]
    impl RequestHandler for PropertyEchoHandler {
        type Request = OrderCreated;
        type Reply = OrderAck;

        async fn handle(
            &self,
            request: OrderCreated,
            properties: Option<&HashMap<String, String>>,
        ) -> Result<Option<OrderAck>> {
            let status = properties
                .and_then(|p| p.get("region").cloned())
                .unwrap_or_else(|| "missing".to_string());
            Ok(Some(OrderAck {
                id: request.id,
                status,
            }))
        }
    }

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::new()
                .register::<OrderCreated>()
                .register::<OrderAck>(),
        )
    }

    fn json_sender(broker: &MemoryBroker) -> Arc<MessageSender> {
        Arc::new(MessageSender::new(
            Arc::new(broker.clone()),
            registry(),
            HashMap::new(),
            SenderConfig {
                format: Format::Json,
                response_format: Format::Json,
                ..Default::default()
            },
        ))
    }

    fn dispatcher(
        broker: &MemoryBroker,
        handlers: HandlerRegistry,
        config: DispatcherConfig,
    ) -> MessageDispatcher {
        MessageDispatcher::new(registry(), handlers, json_sender(broker), config)
    }

    fn json_config() -> DispatcherConfig {
        DispatcherConfig {
            format: Format::Json,
            response_format: Format::Json,
            ..Default::default()
        }
    }

    fn inbound_with_reply(reply_to: Destination) -> Message {
        let mut message = Message::text(r#"{"id":42}"#);
        message.correlation_id = Some("corr-42".to_string());
        message.reply_to = Some(reply_to);
        message
    }

    async fn take_one(broker: &MemoryBroker, destination: &Destination) -> Message {
        let connection = broker.create_connection().await.unwrap();
        let session = connection.create_session(false).await.unwrap();
        let consumer = session.create_consumer(destination, None).await.unwrap();
        consumer
            .recv(Some(Duration::from_millis(500)))
            .await
            .unwrap()
            .expect("expected a reply")
    }

    #[tokio::test]
    async fn test_dispatch_invokes_handler_and_replies() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(
            &broker,
            HandlerRegistry::new().register(AckHandler),
            json_config(),
        );

        let reply_to = Destination::queue("acks");
        let mut inbound = inbound_with_reply(reply_to.clone());
        inbound
            .properties
            .insert("trace".to_string(), "abc".to_string());

        dispatcher.dispatch(&inbound).await.unwrap();

        let reply = take_one(&broker, &reply_to).await;
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-42"));
        assert_eq!(reply.reply_to, Some(reply_to));
        assert_eq!(reply.properties.get("trace").unwrap(), "abc");
        let ack: OrderAck = serde_json::from_str(reply.text_body().unwrap()).unwrap();
        assert_eq!(ack, OrderAck { id: 42, status: "OK".into() });
    }

    #[tokio::test]
    async fn test_dispatch_preserves_remaining_lifetime() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(
            &broker,
            HandlerRegistry::new().register(AckHandler),
            json_config(),
        );

        let reply_to = Destination::queue("acks-ttl");
        let mut inbound = inbound_with_reply(reply_to.clone());
        inbound.timestamp_ms = crate::message::epoch_ms();
        inbound.expiration_ms = inbound.timestamp_ms + 30_000;

        dispatcher.dispatch(&inbound).await.unwrap();

        let reply = take_one(&broker, &reply_to).await;
        // outbound ttl equals the inbound remaining lifetime, so the new
        // expiration window matches the original 30s one
        let window = reply.expiration_ms - reply.timestamp_ms;
        assert_eq!(window, 30_000);
    }

    #[tokio::test]
    async fn test_reply_falls_back_to_sender_default_ttl() {
        let broker = MemoryBroker::new();
        let sender = Arc::new(MessageSender::new(
            Arc::new(broker.clone()),
            registry(),
            HashMap::new(),
            SenderConfig {
                format: Format::Json,
                response_format: Format::Json,
                time_to_live: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        ));
        let dispatcher = MessageDispatcher::new(
            registry(),
            HandlerRegistry::new().register(AckHandler),
            sender,
            json_config(),
        );

        // the inbound message carries no expiration, so the reply gets the
        // sender's configured default rather than no ttl at all
        let reply_to = Destination::queue("acks-default-ttl");
        dispatcher
            .dispatch(&inbound_with_reply(reply_to.clone()))
            .await
            .unwrap();

        let reply = take_one(&broker, &reply_to).await;
        assert_eq!(reply.expiration_ms - reply.timestamp_ms, 30_000);
    }

    #[tokio::test]
    async fn test_dispatch_without_reply_metadata_sends_nothing() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(
            &broker,
            HandlerRegistry::new().register(AckHandler),
            json_config(),
        );

        // no correlation id, no reply-to
        let inbound = Message::text(r#"{"id":42}"#);
        dispatcher.dispatch(&inbound).await.unwrap();
    }

    #[tokio::test]
    async fn test_fire_and_forget_handler_sends_no_reply() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(
            &broker,
            HandlerRegistry::new().register(SilentHandler),
            json_config(),
        );

        let reply_to = Destination::queue("silent");
        dispatcher
            .dispatch(&inbound_with_reply(reply_to.clone()))
            .await
            .unwrap();

        let connection = broker.create_connection().await.unwrap();
        let session = connection.create_session(false).await.unwrap();
        let consumer = session.create_consumer(&reply_to, None).await.unwrap();
        assert!(consumer
            .recv(Some(Duration::from_millis(30)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_handler_is_config_error() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(&broker, HandlerRegistry::new(), json_config());

        let err = dispatcher
            .dispatch(&Message::text(r#"{"id":42}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Config { .. }));
    }

    #[tokio::test]
    async fn test_non_text_payload_rejected() {
        let broker = MemoryBroker::new();
        let dispatcher = dispatcher(
            &broker,
            HandlerRegistry::new().register(AckHandler),
            json_config(),
        );

        let mut inbound = Message::text("");
        inbound.body = crate::message::Body::Bytes(vec![1, 2, 3]);
        let err = dispatcher.dispatch(&inbound).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_properties_passed_when_required() {
        let broker = MemoryBroker::new();
        let config = DispatcherConfig {
            properties_required: true,
            ..json_config()
        };
        let dispatcher = dispatcher(
            &broker,
            HandlerRegistry::new().register(PropertyEchoHandler),
            config,
        );

        let reply_to = Destination::queue("props");
        let mut inbound = inbound_with_reply(reply_to.clone());
        inbound
            .properties
            .insert("region".to_string(), "eu".to_string());
        dispatcher.dispatch(&inbound).await.unwrap();

        let reply = take_one(&broker, &reply_to).await;
        let ack: OrderAck = serde_json::from_str(reply.text_body().unwrap()).unwrap();
        assert_eq!(ack.status, "eu");
    }

    #[tokio::test]
    async fn test_reply_to_override_redirects_reply() {
        let broker = MemoryBroker::new();
        let override_dest = Destination::queue("audit");
        let config = DispatcherConfig {
            reply_to_override: Some(override_dest.clone()),
            ..json_config()
        };
        let dispatcher = dispatcher(
            &broker,
            HandlerRegistry::new().register(AckHandler),
            config,
        );

        let reply_to = Destination::queue("unused-reply");
        dispatcher
            .dispatch(&inbound_with_reply(reply_to.clone()))
            .await
            .unwrap();

        let reply = take_one(&broker, &override_dest).await;
        // the original reply-to is preserved on the message even though it
        // was routed elsewhere
        assert_eq!(reply.reply_to, Some(reply_to));
    }

    #[tokio::test]
    async fn test_serve_loop_end_to_end() {
        let broker = MemoryBroker::new();
        let dispatcher = Arc::new(dispatcher(
            &broker,
            HandlerRegistry::new().register(AckHandler),
            json_config(),
        ));

        let requests = Destination::queue("loop-requests");
        let connection = broker.create_connection().await.unwrap();
        let session = connection.create_session(false).await.unwrap();
        let consumer = session.create_consumer(&requests, None).await.unwrap();
        let listener = dispatcher.spawn_listener(consumer.clone());

        let reply_to = Destination::queue("loop-replies");
        let producer = session.create_producer(&requests).await.unwrap();
        producer
            .send(inbound_with_reply(reply_to.clone()), None)
            .await
            .unwrap();

        let reply = take_one(&broker, &reply_to).await;
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-42"));

        consumer.close().await.unwrap();
        listener.await.unwrap();
    }
}
