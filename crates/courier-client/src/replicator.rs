//! Message replication across brokers.
//!
//! A replicator forwards text messages from one broker to another, preserving
//! body, properties, correlation metadata, priority and remaining lifetime.
//! Because it targets the transport traits rather than a broker, the source
//! and destination can be different broker technologies.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::message::{Destination, Message};
use crate::transport::{
    close_connection_quietly, close_producer_quietly, close_session_quietly, Connection,
    ConnectionFactory, Consumer,
};

/// Forwards messages onto another broker.
pub struct Replicator {
    factory: Arc<dyn ConnectionFactory>,
    destination: Option<Destination>,
}

impl Replicator {
    /// Creates a replicator that routes each message to its own reply-to
    /// address on the target broker.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            destination: None,
        }
    }

    /// Creates a replicator that routes every message to a fixed destination
    /// on the target broker, ignoring reply-to.
    pub fn with_destination(factory: Arc<dyn ConnectionFactory>, destination: Destination) -> Self {
        Self {
            factory,
            destination: Some(destination),
        }
    }

    /// Forwards one message to the target broker.
    ///
    /// The copy carries the original body, properties, correlation id,
    /// reply-to and priority; its time-to-live is the original's remaining
    /// lifetime so the end-to-end expiry holds across brokers.
    pub async fn replicate(&self, message: &Message) -> Result<()> {
        let text = message.text_body()?;
        let target = match &self.destination {
            Some(destination) => destination,
            None => message.reply_to.as_ref().ok_or_else(|| {
                ClientError::config("message has no reply destination to replicate to")
            })?,
        };

        let mut copy = Message::text(text);
        copy.properties = message.properties.clone();
        copy.correlation_id = message.correlation_id.clone();
        copy.reply_to = message.reply_to.clone();
        copy.priority = message.priority;
        let time_to_live = message.remaining_lifetime();

        debug!(destination = %target, "replicating message");
        let connection = self.factory.create_connection().await?;
        let outcome = self.forward(&*connection, target, copy, time_to_live).await;
        close_connection_quietly(&*connection).await;
        outcome
    }

    async fn forward(
        &self,
        connection: &dyn Connection,
        target: &Destination,
        message: Message,
        time_to_live: Option<std::time::Duration>,
    ) -> Result<()> {
        let session = connection.create_session(false).await?;
        let outcome = async {
            let producer = session.create_producer(target).await?;
            let outcome = producer.send(message, time_to_live).await;
            close_producer_quietly(&*producer).await;
            outcome
        }
        .await;
        close_session_quietly(&*session).await;
        outcome
    }

    /// Runs a forwarding loop over a consumer on the source broker: receive,
    /// replicate, log failures, continue. Stops when the consumer is closed.
    pub fn spawn_listener(self: Arc<Self>, consumer: Arc<dyn Consumer>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match consumer.recv(None).await {
                    Ok(Some(message)) => {
                        if let Err(e) = self.replicate(&message).await {
                            warn!(error = %e, "message replication failed");
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(error = %e, "replicator consumer closed");
                        break;
                    }
                }
            }
        })
    }
}
