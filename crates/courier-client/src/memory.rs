//! In-memory broker implementing the transport capability.
//!
//! Queues deliver each message to exactly one of the competing consumers;
//! topics fan out to every subscriber. Temporary queues live until the
//! connection that created them closes. Expired messages are dropped at
//! receive time. Transacted sessions buffer sends until `commit()`.
//!
//! This is the in-process reference implementation of the capability traits,
//! used by the whole test suite and usable as an embedded broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::message::{epoch_ms, Destination, Message};
use crate::selector::Selector;
use crate::transport::{Connection, ConnectionFactory, Consumer, Producer, Session};

/// An in-memory broker. Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("queues", &self.state.queues.len())
            .finish()
    }
}

#[derive(Default)]
struct BrokerState {
    queues: DashMap<String, Arc<QueueState>>,
    topics: DashMap<String, Mutex<Vec<Arc<QueueState>>>>,
}

impl BrokerState {
    fn queue(&self, key: &str) -> Arc<QueueState> {
        self.queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(QueueState::default()))
            .clone()
    }

    fn publish(&self, destination: &Destination, message: Message) -> Result<()> {
        match destination {
            Destination::Queue(_) => {
                self.queue(&destination.to_string()).push(message);
                Ok(())
            }
            Destination::Temporary(_) => {
                // single-use reply queues are never auto-created: once the
                // owning connection is gone the reply has nowhere to go
                let queue = self
                    .queues
                    .get(&destination.to_string())
                    .map(|q| q.clone())
                    .ok_or_else(|| {
                        ClientError::transport(format!(
                            "temporary destination [{destination}] no longer exists"
                        ))
                    })?;
                queue.push(message);
                Ok(())
            }
            Destination::Topic(_) => {
                if let Some(subscribers) = self.topics.get(&destination.to_string()) {
                    let subscribers = subscribers.lock().unwrap();
                    for subscriber in subscribers.iter() {
                        subscriber.push(message.clone());
                    }
                }
                Ok(())
            }
        }
    }

    fn subscribe(&self, topic_key: &str) -> Arc<QueueState> {
        let queue = Arc::new(QueueState::default());
        self.topics
            .entry(topic_key.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .unwrap()
            .push(queue.clone());
        queue
    }

    fn unsubscribe(&self, topic_key: &str, queue: &Arc<QueueState>) {
        if let Some(subscribers) = self.topics.get(topic_key) {
            subscribers
                .lock()
                .unwrap()
                .retain(|q| !Arc::ptr_eq(q, queue));
        }
    }
}

#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl QueueState {
    fn push(&self, message: Message) {
        self.messages.lock().unwrap().push_back(message);
        self.notify.notify_waiters();
    }

    /// Removes and returns the first live message matching the selector,
    /// discarding expired messages encountered on the way.
    fn pop_matching(&self, selector: Option<&Selector>) -> Option<Message> {
        let mut messages = self.messages.lock().unwrap();
        let mut index = 0;
        while index < messages.len() {
            if messages[index].is_expired() {
                messages.remove(index);
                continue;
            }
            let matches = selector
                .map(|s| s.matches(&messages[index].properties))
                .unwrap_or(true);
            if matches {
                return messages.remove(index);
            }
            index += 1;
        }
        None
    }

    fn snapshot_matching(&self, selector: Option<&Selector>) -> Vec<Message> {
        let messages = self.messages.lock().unwrap();
        messages
            .iter()
            .filter(|m| !m.is_expired())
            .filter(|m| selector.map(|s| s.matches(&m.properties)).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            shared: Arc::new(ConnShared {
                temporary_queues: Mutex::new(Vec::new()),
            }),
            closed: AtomicBool::new(false),
        }))
    }
}

struct ConnShared {
    temporary_queues: Mutex<Vec<String>>,
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    shared: Arc<ConnShared>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_session(&self, transacted: bool) -> Result<Box<dyn Session>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::transport("connection is closed"));
        }
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            conn: self.shared.clone(),
            transacted,
            buffered: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    async fn start(&self) -> Result<()> {
        // delivery in the in-memory broker is always live
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let temporaries = std::mem::take(&mut *self.shared.temporary_queues.lock().unwrap());
        for key in temporaries {
            if let Some((_, queue)) = self.state.queues.remove(&key) {
                // wake any consumer still blocked on the removed queue
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

struct MemorySession {
    state: Arc<BrokerState>,
    conn: Arc<ConnShared>,
    transacted: bool,
    buffered: Arc<Mutex<Vec<(Destination, Message)>>>,
}

#[async_trait]
impl Session for MemorySession {
    async fn create_producer(&self, destination: &Destination) -> Result<Box<dyn Producer>> {
        Ok(Box::new(MemoryProducer {
            state: self.state.clone(),
            destination: destination.clone(),
            buffer: self.transacted.then(|| self.buffered.clone()),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Arc<dyn Consumer>> {
        let selector = selector.map(Selector::parse).transpose()?;
        let key = destination.to_string();
        let (queue, subscription) = match destination {
            Destination::Topic(_) => (self.state.subscribe(&key), Some(key)),
            Destination::Queue(_) => (self.state.queue(&key), None),
            Destination::Temporary(_) => {
                let queue = self
                    .state
                    .queues
                    .get(&key)
                    .map(|q| q.clone())
                    .ok_or_else(|| {
                        ClientError::transport(format!(
                            "temporary destination [{destination}] no longer exists"
                        ))
                    })?;
                (queue, None)
            }
        };
        Ok(Arc::new(MemoryConsumer {
            state: self.state.clone(),
            queue,
            selector,
            subscription,
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_temporary_queue(&self) -> Result<Destination> {
        let destination = Destination::Temporary(format!("reply-{}", Uuid::new_v4()));
        let key = destination.to_string();
        self.state
            .queues
            .insert(key.clone(), Arc::new(QueueState::default()));
        self.conn.temporary_queues.lock().unwrap().push(key);
        Ok(destination)
    }

    async fn browse(&self, queue: &Destination, selector: Option<&str>) -> Result<Vec<Message>> {
        let selector = selector.map(Selector::parse).transpose()?;
        Ok(self
            .state
            .queue(&queue.to_string())
            .snapshot_matching(selector.as_ref()))
    }

    async fn commit(&self) -> Result<()> {
        if !self.transacted {
            return Err(ClientError::transport("session is not transacted"));
        }
        let buffered = std::mem::take(&mut *self.buffered.lock().unwrap());
        for (destination, message) in buffered {
            self.state.publish(&destination, message)?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if !self.transacted {
            return Err(ClientError::transport("session is not transacted"));
        }
        self.buffered.lock().unwrap().clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // uncommitted transacted sends are discarded
        self.buffered.lock().unwrap().clear();
        Ok(())
    }
}

struct MemoryProducer {
    state: Arc<BrokerState>,
    destination: Destination,
    buffer: Option<Arc<Mutex<Vec<(Destination, Message)>>>>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, mut message: Message, time_to_live: Option<Duration>) -> Result<()> {
        message.timestamp_ms = epoch_ms();
        message.expiration_ms = time_to_live
            .map(|ttl| message.timestamp_ms.saturating_add(ttl.as_millis() as u64))
            .unwrap_or(0);
        match &self.buffer {
            Some(buffer) => {
                buffer
                    .lock()
                    .unwrap()
                    .push((self.destination.clone(), message));
                Ok(())
            }
            None => self.state.publish(&self.destination, message),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<BrokerState>,
    queue: Arc<QueueState>,
    selector: Option<Selector>,
    subscription: Option<String>,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ClientError::transport("consumer is closed"));
            }
            // register interest before checking the queue so a push that
            // lands between the check and the wait is still observed
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.queue.pop_matching(self.selector.as_ref()) {
                return Ok(Some(message));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(topic_key) = &self.subscription {
                self.state.unsubscribe(topic_key, &self.queue);
            }
            self.queue.notify.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Body;

    async fn session(broker: &MemoryBroker) -> (Box<dyn Connection>, Box<dyn Session>) {
        let conn = broker.create_connection().await.unwrap();
        let session = conn.create_session(false).await.unwrap();
        (conn, session)
    }

    #[tokio::test]
    async fn test_queue_send_and_receive() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let dest = Destination::queue("orders");

        let producer = session.create_producer(&dest).await.unwrap();
        producer.send(Message::text("hello"), None).await.unwrap();

        let consumer = session.create_consumer(&dest, None).await.unwrap();
        let received = consumer
            .recv(Some(Duration::from_millis(200)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.body, Body::Text("hello".to_string()));
        assert!(received.timestamp_ms > 0);
    }

    #[tokio::test]
    async fn test_receive_timeout_returns_none() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let consumer = session
            .create_consumer(&Destination::queue("empty"), None)
            .await
            .unwrap();
        let received = consumer.recv(Some(Duration::from_millis(50))).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_selector_filters_messages() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let dest = Destination::queue("selected");
        let producer = session.create_producer(&dest).await.unwrap();

        let mut other = Message::text("other");
        other.properties.insert("type".into(), "NOISE".into());
        producer.send(other, None).await.unwrap();

        let mut wanted = Message::text("wanted");
        wanted.properties.insert("type".into(), "ORDER".into());
        producer.send(wanted, None).await.unwrap();

        let consumer = session
            .create_consumer(&dest, Some("type = 'ORDER'"))
            .await
            .unwrap();
        let received = consumer
            .recv(Some(Duration::from_millis(200)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.body, Body::Text("wanted".to_string()));
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_all_subscribers() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let topic = Destination::topic("events");

        let first = session.create_consumer(&topic, None).await.unwrap();
        let second = session.create_consumer(&topic, None).await.unwrap();

        let producer = session.create_producer(&topic).await.unwrap();
        producer.send(Message::text("tick"), None).await.unwrap();

        for consumer in [&first, &second] {
            let received = consumer
                .recv(Some(Duration::from_millis(200)))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received.body, Body::Text("tick".to_string()));
        }
    }

    #[tokio::test]
    async fn test_temporary_queue_removed_on_connection_close() {
        let broker = MemoryBroker::new();
        let conn = broker.create_connection().await.unwrap();
        let sess = conn.create_session(false).await.unwrap();
        let temp = sess.create_temporary_queue().await.unwrap();

        let (_conn2, session2) = session(&broker).await;
        let producer = session2.create_producer(&temp).await.unwrap();
        producer.send(Message::text("ok"), None).await.unwrap();

        conn.close().await.unwrap();
        let err = producer.send(Message::text("late"), None).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_expired_message_dropped_on_receive() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let dest = Destination::queue("expiring");
        let producer = session.create_producer(&dest).await.unwrap();
        producer
            .send(Message::text("gone"), Some(Duration::from_millis(1)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let consumer = session.create_consumer(&dest, None).await.unwrap();
        let received = consumer.recv(Some(Duration::from_millis(30))).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_transacted_session_buffers_until_commit() {
        let broker = MemoryBroker::new();
        let conn = broker.create_connection().await.unwrap();
        let tx_session = conn.create_session(true).await.unwrap();
        let dest = Destination::queue("tx");

        let producer = tx_session.create_producer(&dest).await.unwrap();
        producer.send(Message::text("staged"), None).await.unwrap();

        let (_conn2, plain) = session(&broker).await;
        let consumer = plain.create_consumer(&dest, None).await.unwrap();
        assert!(consumer
            .recv(Some(Duration::from_millis(30)))
            .await
            .unwrap()
            .is_none());

        tx_session.commit().await.unwrap();
        let received = consumer
            .recv(Some(Duration::from_millis(200)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.body, Body::Text("staged".to_string()));
    }

    #[tokio::test]
    async fn test_transacted_rollback_discards() {
        let broker = MemoryBroker::new();
        let conn = broker.create_connection().await.unwrap();
        let tx_session = conn.create_session(true).await.unwrap();
        let dest = Destination::queue("tx-rollback");

        let producer = tx_session.create_producer(&dest).await.unwrap();
        producer.send(Message::text("staged"), None).await.unwrap();
        tx_session.rollback().await.unwrap();
        tx_session.commit().await.unwrap();

        let (_conn2, plain) = session(&broker).await;
        let consumer = plain.create_consumer(&dest, None).await.unwrap();
        assert!(consumer
            .recv(Some(Duration::from_millis(30)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_browse_is_non_destructive() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let dest = Destination::queue("browse");
        let producer = session.create_producer(&dest).await.unwrap();
        producer.send(Message::text("one"), None).await.unwrap();
        producer.send(Message::text("two"), None).await.unwrap();

        let browsed = session.browse(&dest, None).await.unwrap();
        assert_eq!(browsed.len(), 2);
        let browsed_again = session.browse(&dest, None).await.unwrap();
        assert_eq!(browsed_again.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_consumer_errors() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let consumer = session
            .create_consumer(&Destination::queue("closing"), None)
            .await
            .unwrap();
        consumer.close().await.unwrap();
        assert!(consumer.recv(None).await.is_err());
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_observed() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let dest = Destination::queue("early");
        let producer = session.create_producer(&dest).await.unwrap();
        let consumer = session.create_consumer(&dest, None).await.unwrap();

        // message lands before recv is ever called
        producer.send(Message::text("first"), None).await.unwrap();
        let received = consumer
            .recv(Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(received.is_some());
    }
}
