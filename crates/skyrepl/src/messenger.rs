//! Per-worker connection multiplexing for the controller.
//!
//! Each worker gets one `MessengerConnector` owning one TCP connection and
//! a FIFO queue of outbound requests. Exactly one request is on the wire at
//! a time; any transport failure tears the connection down, requeues the
//! interrupted send at the front and retries after a fixed backoff, forever.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::config::Config;
use crate::proto::{self, RequestFrame, ResponseFrame};

/// Completion callback for one wire exchange. `success` is false on any
/// transport-level failure; the response is present only on success.
pub type SendCallback = Box<dyn FnOnce(bool, Option<ResponseFrame>) + Send + Sync + 'static>;

/// Connection lifecycle, for logging and introspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorState {
    Initial,
    Connecting,
    Communicating,
}

struct QueuedSend {
    id: String,
    payload: Bytes,
    on_complete: SendCallback,
}

struct ConnectorInner {
    state: ConnectorState,
    queue: VecDeque<QueuedSend>,
    in_flight: Option<String>,
    abort_in_flight: bool,
    shutdown: bool,
}

enum Exchange {
    Response(ResponseFrame),
    /// Socket failure before the reply arrived; the request is retried on a
    /// fresh connection.
    Interrupted(anyhow::Error),
    /// The worker answered with garbage; the request fails, the connection
    /// restarts.
    ProtocolViolation(anyhow::Error),
    Aborted,
}

/// One worker's connection and request queue.
pub struct MessengerConnector {
    worker: String,
    config: Arc<Config>,
    inner: Mutex<ConnectorInner>,
    wake: Notify,
}

impl MessengerConnector {
    fn new(worker: String, config: Arc<Config>) -> Arc<Self> {
        let connector = Arc::new(Self {
            worker,
            config,
            inner: Mutex::new(ConnectorInner {
                state: ConnectorState::Initial,
                queue: VecDeque::new(),
                in_flight: None,
                abort_in_flight: false,
                shutdown: false,
            }),
            wake: Notify::new(),
        });
        tokio::spawn(connector.clone().run());
        connector
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.lock().unwrap().state
    }

    /// Queued sends, not counting the one on the wire.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Enqueue one exchange. Submitting an id that is already queued or on
    /// the wire is a caller bug.
    fn send(&self, id: String, payload: Bytes, on_complete: SendCallback) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            bail!("messenger connector for {} is stopped", self.worker);
        }
        if inner.in_flight.as_deref() == Some(id.as_str())
            || inner.queue.iter().any(|item| item.id == id)
        {
            bail!("request {id} is already registered with worker {}", self.worker);
        }
        inner.queue.push_back(QueuedSend {
            id,
            payload,
            on_complete,
        });
        drop(inner);
        self.wake.notify_waiters();
        Ok(())
    }

    /// Remove a queued exchange, or abort it if it is on the wire. No
    /// completion callback fires for a cancelled exchange.
    fn cancel(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.queue.iter().position(|item| item.id == id) {
            inner.queue.remove(index);
            debug!(worker = %self.worker, id, "cancelled queued request");
            return;
        }
        if inner.in_flight.as_deref() == Some(id) {
            inner.abort_in_flight = true;
            drop(inner);
            debug!(worker = %self.worker, id, "aborting in-flight request");
            self.wake.notify_waiters();
        }
    }

    /// Stop the connector; every pending exchange completes with a failure.
    fn stop(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.wake.notify_waiters();
    }

    fn set_state(&self, state: ConnectorState) {
        self.inner.lock().unwrap().state = state;
    }

    async fn run(self: Arc<Self>) {
        loop {
            // wait for work before dialing
            loop {
                let notified = self.wake.notified();
                {
                    let inner = self.inner.lock().unwrap();
                    if inner.shutdown {
                        drop(inner);
                        self.fail_all();
                        return;
                    }
                    if !inner.queue.is_empty() {
                        break;
                    }
                }
                notified.await;
            }

            self.set_state(ConnectorState::Connecting);
            let addr = match self.config.worker(&self.worker) {
                Ok(info) => info.svc_addr(),
                Err(err) => {
                    warn!(worker = %self.worker, %err, "cannot resolve worker");
                    self.set_state(ConnectorState::Initial);
                    time::sleep(self.config.retry_timeout()).await;
                    continue;
                }
            };
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    debug!(worker = %self.worker, %addr, "connected");
                    self.set_state(ConnectorState::Communicating);
                    match self.communicate(stream).await {
                        Ok(()) => {
                            self.set_state(ConnectorState::Initial);
                            self.fail_all();
                            return;
                        }
                        Err(err) => {
                            debug!(worker = %self.worker, %err, "connection reset");
                            self.set_state(ConnectorState::Initial);
                            time::sleep(self.config.retry_timeout()).await;
                        }
                    }
                }
                Err(err) => {
                    warn!(worker = %self.worker, %addr, %err, "connect failed");
                    self.set_state(ConnectorState::Initial);
                    time::sleep(self.config.retry_timeout()).await;
                }
            }
        }
    }

    /// Drive exchanges over one established connection. Returns Ok on
    /// shutdown; any error means the connection must be rebuilt.
    async fn communicate(&self, stream: TcpStream) -> anyhow::Result<()> {
        let mut framed = proto::framed(stream);
        loop {
            let notified = self.wake.notified();
            let next = {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutdown {
                    return Ok(());
                }
                match inner.queue.pop_front() {
                    Some(item) => {
                        inner.in_flight = Some(item.id.clone());
                        inner.abort_in_flight = false;
                        Some(item)
                    }
                    None => None,
                }
            };
            let Some(item) = next else {
                notified.await;
                continue;
            };

            match self.exchange(&mut framed, &item).await {
                Exchange::Response(response) => {
                    self.clear_in_flight();
                    let callback = item.on_complete;
                    tokio::spawn(async move { callback(true, Some(response)) });
                }
                Exchange::Interrupted(err) => {
                    // retried first once the connection is rebuilt; only the
                    // request's own expiration timer gives up on it
                    let mut inner = self.inner.lock().unwrap();
                    inner.in_flight = None;
                    inner.queue.push_front(item);
                    drop(inner);
                    return Err(err);
                }
                Exchange::ProtocolViolation(err) => {
                    warn!(worker = %self.worker, id = %item.id, %err, "protocol violation");
                    self.clear_in_flight();
                    let callback = item.on_complete;
                    tokio::spawn(async move { callback(false, None) });
                    return Err(err);
                }
                Exchange::Aborted => {
                    self.clear_in_flight();
                    if self.inner.lock().unwrap().shutdown {
                        let callback = item.on_complete;
                        tokio::spawn(async move { callback(false, None) });
                        return Ok(());
                    }
                    // the stream may hold a half-finished exchange
                    drop(item);
                    bail!("in-flight request cancelled");
                }
            }
        }
    }

    async fn exchange(
        &self,
        framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
        item: &QueuedSend,
    ) -> Exchange {
        tokio::select! {
            result = framed.send(item.payload.clone()) => {
                if let Err(err) = result {
                    return Exchange::Interrupted(err.into());
                }
            }
            _ = self.wait_abort() => return Exchange::Aborted,
        }
        tokio::select! {
            message = framed.next() => {
                match message {
                    None => Exchange::Interrupted(anyhow!("connection closed by worker")),
                    Some(Err(err)) => Exchange::Interrupted(err.into()),
                    Some(Ok(bytes)) => match proto::decode_response(&bytes) {
                        Err(err) => Exchange::ProtocolViolation(err),
                        Ok(response) if response.id != item.id => {
                            Exchange::ProtocolViolation(anyhow!(
                                "response id {} does not match request id {}",
                                response.id, item.id,
                            ))
                        }
                        Ok(response) => Exchange::Response(response),
                    },
                }
            }
            _ = self.wait_abort() => Exchange::Aborted,
        }
    }

    /// Resolve when the in-flight exchange must be abandoned.
    async fn wait_abort(&self) {
        loop {
            let notified = self.wake.notified();
            {
                let inner = self.inner.lock().unwrap();
                if inner.abort_in_flight || inner.shutdown {
                    return;
                }
            }
            notified.await;
        }
    }

    fn clear_in_flight(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = None;
        inner.abort_in_flight = false;
    }

    /// Complete every queued exchange with a failure.
    fn fail_all(&self) {
        let drained: Vec<QueuedSend> = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight = None;
            inner.queue.drain(..).collect()
        };
        for item in drained {
            let callback = item.on_complete;
            tokio::spawn(async move { callback(false, None) });
        }
    }
}

/// Controller-wide messenger: one connector per worker, created lazily.
pub struct Messenger {
    config: Arc<Config>,
    connectors: Mutex<HashMap<String, Arc<MessengerConnector>>>,
}

impl Messenger {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            connectors: Mutex::new(HashMap::new()),
        })
    }

    fn connector(&self, worker: &str) -> Arc<MessengerConnector> {
        let mut connectors = self.connectors.lock().unwrap();
        connectors
            .entry(worker.to_string())
            .or_insert_with(|| {
                MessengerConnector::new(worker.to_string(), self.config.clone())
            })
            .clone()
    }

    /// Queue one exchange with a worker.
    pub fn send(
        &self,
        worker: &str,
        id: &str,
        frame: &RequestFrame,
        on_complete: SendCallback,
    ) -> anyhow::Result<()> {
        let payload = proto::encode_request(frame)?;
        self.connector(worker).send(id.to_string(), payload, on_complete)
    }

    /// Cancel one exchange with a worker, queued or on the wire.
    pub fn cancel(&self, worker: &str, id: &str) {
        let connector = {
            let connectors = self.connectors.lock().unwrap();
            connectors.get(worker).cloned()
        };
        if let Some(connector) = connector {
            connector.cancel(id);
        }
    }

    /// Queued exchanges for one worker, for introspection.
    pub fn queue_len(&self, worker: &str) -> usize {
        let connectors = self.connectors.lock().unwrap();
        connectors.get(worker).map_or(0, |c| c.queue_len())
    }

    /// Stop every connector; pending exchanges complete with failures.
    pub fn stop(&self) {
        let connectors: Vec<Arc<MessengerConnector>> =
            self.connectors.lock().unwrap().values().cloned().collect();
        for connector in connectors {
            connector.stop();
        }
    }
}
