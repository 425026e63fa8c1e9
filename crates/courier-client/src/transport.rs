//! Abstract transport capability consumed by the client.
//!
//! This module defines the ConnectionFactory, Connection, Session, Producer
//! and Consumer traits that the sender, receiver, dispatcher and replicator
//! are written against. The broker itself is a black box behind these traits;
//! [`crate::memory`] provides the in-process implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Destination, Message};

/// Creates connections to one broker.
///
/// Implementations for different broker technologies can be swapped freely;
/// the replicator relies on this to bridge messages across technologies.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Opens a new connection.
    async fn create_connection(&self) -> Result<Box<dyn Connection>>;
}

/// An open connection to the broker.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Creates a session. A transacted session buffers sends until
    /// `commit()`; a non-transacted session delivers immediately.
    async fn create_session(&self, transacted: bool) -> Result<Box<dyn Session>>;

    /// Starts inbound delivery for consumers created on this connection.
    async fn start(&self) -> Result<()>;

    /// Closes the connection. Temporary queues scoped to it are removed.
    async fn close(&self) -> Result<()>;
}

/// A session: the scope producers, consumers and temporary queues live in.
#[async_trait]
pub trait Session: Send + Sync {
    /// Creates a producer bound to a destination.
    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn Producer>>;

    /// Creates a consumer bound to a destination, optionally filtered by a
    /// selector expression.
    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Arc<dyn Consumer>>;

    /// Creates a temporary queue scoped to this session's connection.
    async fn create_temporary_queue(&self) -> Result<Destination>;

    /// Non-destructively reads every message currently on a queue that
    /// matches the selector.
    async fn browse(&self, queue: &Destination, selector: Option<&str>) -> Result<Vec<Message>>;

    /// Commits buffered sends of a transacted session.
    async fn commit(&self) -> Result<()>;

    /// Discards buffered sends of a transacted session.
    async fn rollback(&self) -> Result<()>;

    /// Closes the session. Uncommitted transacted sends are discarded.
    async fn close(&self) -> Result<()>;
}

/// Sends messages to one destination.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Sends a message, stamping its timestamp and, when `time_to_live` is
    /// given, its absolute expiration.
    async fn send(&self, message: Message, time_to_live: Option<Duration>) -> Result<()>;

    /// Closes the producer.
    async fn close(&self) -> Result<()>;
}

/// Receives messages from one destination.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Receives the next message.
    ///
    /// With a timeout, returns `Ok(None)` when it elapses without a message.
    /// Without one, waits indefinitely. Returns an error once the consumer
    /// is closed.
    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>>;

    /// Closes the consumer, waking any blocked `recv`.
    async fn close(&self) -> Result<()>;
}

// Close helpers shared by every resource-owning call path: release failures
// are logged, never propagated past the primary outcome.

pub(crate) async fn close_connection_quietly(connection: &dyn Connection) {
    if let Err(e) = connection.close().await {
        tracing::error!(error = %e, "could not close connection");
    }
}

pub(crate) async fn close_session_quietly(session: &dyn Session) {
    if let Err(e) = session.close().await {
        tracing::error!(error = %e, "could not close session");
    }
}

pub(crate) async fn close_producer_quietly(producer: &dyn Producer) {
    if let Err(e) = producer.close().await {
        tracing::error!(error = %e, "could not close message producer");
    }
}

pub(crate) async fn close_consumer_quietly(consumer: &dyn Consumer) {
    if let Err(e) = consumer.close().await {
        tracing::error!(error = %e, "could not close message consumer");
    }
}
