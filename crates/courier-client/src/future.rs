//! Correlation future: the single-outstanding-call reply primitive.
//!
//! A [`ReplyFuture`] is bound to one reply destination and one expected
//! result type. A background listener task receives exactly one message from
//! the bound consumer, decodes it, and releases the waiting caller. Terminal
//! states are sticky; a completion that lands before the wait begins is still
//! observed because notify registration precedes every predicate check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::error::{ClientError, Result};
use crate::transport::{Connection, Consumer, Session};

/// State of a correlation future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No reply has arrived yet.
    Waiting,
    /// A decoded result is (or was) available.
    Done,
    /// The call was cancelled before a reply arrived.
    Cancelled,
    /// The reply arrived but could not be decoded, or the transport failed.
    Error,
}

struct Inner<T> {
    state: CallState,
    result: Option<T>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    closing: AtomicBool,
}

/// A pending reply for one outbound request.
///
/// Owns the reply consumer, its session, and its connection for the duration
/// of the call; [`ReplyFuture::close`] releases all three. At most one reply
/// is ever accepted — the reply destination is single-use.
pub struct ReplyFuture<T> {
    shared: Arc<Shared<T>>,
    consumer: Arc<dyn Consumer>,
    session: Box<dyn Session>,
    connection: Box<dyn Connection>,
    listener: JoinHandle<()>,
}

impl<T: Send + 'static> ReplyFuture<T> {
    /// Binds a future to an already-created reply consumer and starts the
    /// listener task. `decode` turns the reply's text body into the expected
    /// result type.
    pub fn new(
        connection: Box<dyn Connection>,
        session: Box<dyn Session>,
        consumer: Arc<dyn Consumer>,
        decode: impl Fn(&str) -> Result<T> + Send + 'static,
    ) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: CallState::Waiting,
                result: None,
            }),
            notify: Notify::new(),
            closing: AtomicBool::new(false),
        });

        let task_shared = shared.clone();
        let task_consumer = consumer.clone();
        let listener = tokio::spawn(async move {
            match task_consumer.recv(None).await {
                Ok(Some(message)) => {
                    let outcome = message.text_body().and_then(|text| decode(text));
                    let mut inner = task_shared.inner.lock().unwrap();
                    if inner.state == CallState::Waiting {
                        match outcome {
                            Ok(value) => {
                                inner.result = Some(value);
                                inner.state = CallState::Done;
                            }
                            Err(e) => {
                                error!(error = %e, "failed to decode reply");
                                inner.state = CallState::Error;
                            }
                        }
                    }
                    drop(inner);
                    task_shared.notify.notify_waiters();
                }
                Ok(None) => {
                    // recv without a timeout never yields None; treat
                    // defensively as a transport failure
                    task_shared.fail_if_waiting("reply consumer yielded no message");
                }
                Err(e) => {
                    if task_shared.closing.load(Ordering::Acquire) {
                        debug!("reply listener stopped by close");
                    } else {
                        task_shared.fail_if_waiting(&format!("reply consumer failed: {e}"));
                    }
                }
            }
        });

        Self {
            shared,
            consumer,
            session,
            connection,
            listener,
        }
    }

    /// Suspends until a result, cancellation, or error lands.
    pub async fn await_result(&self) -> Result<T> {
        self.wait(None).await
    }

    /// Suspends until a result, cancellation, or error lands, or the timeout
    /// elapses. The timeout is a temporal outcome reported as
    /// [`ClientError::Timeout`], distinct from any failure.
    pub async fn await_timeout(&self, timeout: Duration) -> Result<T> {
        self.wait(Some(timeout)).await
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // register interest before checking state: a signal that happens
            // before the wait begins must still be observed
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.inner.lock().unwrap();
                match inner.state {
                    CallState::Done => {
                        return inner.result.take().ok_or(ClientError::ReplyFailed);
                    }
                    CallState::Cancelled => return Err(ClientError::Cancelled),
                    CallState::Error => return Err(ClientError::ReplyFailed),
                    CallState::Waiting => {}
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(ClientError::Timeout {
                            elapsed_ms: timeout.unwrap_or_default().as_millis() as u64,
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Cancels the call. Only effective while waiting; terminal states are
    /// sticky and a stored result is never altered. Returns `true` when the
    /// state actually transitioned.
    pub fn cancel(&self) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.state == CallState::Waiting {
            inner.state = CallState::Cancelled;
            drop(inner);
            self.shared.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    /// Current state of the call.
    pub fn state(&self) -> CallState {
        self.shared.inner.lock().unwrap().state
    }

    /// Returns `true` once a decoded result has landed.
    pub fn is_done(&self) -> bool {
        self.state() == CallState::Done
    }

    /// Returns `true` once the call has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == CallState::Cancelled
    }

    /// Releases the consumer, then the session, then the connection.
    ///
    /// Every release is attempted even if an earlier one fails; the first
    /// failure is reported. An in-flight reply arriving after close is
    /// discarded along with the single-use reply destination.
    pub async fn close(self) -> Result<()> {
        self.shared.closing.store(true, Ordering::Release);

        let mut first_failure = None;
        if let Err(e) = self.consumer.close().await {
            error!(error = %e, "could not close reply consumer");
            first_failure.get_or_insert(e);
        }
        self.listener.abort();
        if let Err(e) = self.session.close().await {
            error!(error = %e, "could not close session");
            first_failure.get_or_insert(e);
        }
        if let Err(e) = self.connection.close().await {
            error!(error = %e, "could not close connection");
            first_failure.get_or_insert(e);
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<T> Shared<T> {
    fn fail_if_waiting(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CallState::Waiting {
            error!(reason, "reply listener failed");
            inner.state = CallState::Error;
        }
        drop(inner);
        self.notify.notify_waiters();
    }
}
