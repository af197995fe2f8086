//! Gateway handle: connect, submit requests, manage subscriptions, disconnect.
//!
//! `Gateway` is cheap to clone; all clones share one connection, one correlator and one
//! router. Dropping the last clone stops the reader loop.

use crate::config::GatewayConfig;
use crate::gateway::connection::{Connector, Frame, WsConnector};
use crate::gateway::correlator::{new_request_id, Correlator};
use crate::gateway::error::GatewayError;
use crate::gateway::protocol::{equals_filter, Envelope, Request, Response};
use crate::gateway::reader;
use crate::gateway::router::{self, Arrival, Removal, Subscription, SubscriptionRouter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Lifecycle of the gateway's connection. Only the gateway changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connection lost unexpectedly; waiting to reopen.
    Reconnecting,
    Disconnecting,
}

/// State shared by gateway handles and the reader loop.
pub(crate) struct Shared {
    pub(crate) config: GatewayConfig,
    pub(crate) correlator: Correlator,
    pub(crate) router: SubscriptionRouter,
    pub(crate) state: watch::Sender<ConnectionState>,
    /// Request id stamped on every state publication of this gateway instance.
    pub(crate) publish_request_id: String,
}

impl Shared {
    pub(crate) fn new(config: GatewayConfig, instance_id: &str) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            router: SubscriptionRouter::new(config.subject_field.clone()),
            correlator: Correlator::new(),
            state,
            publish_request_id: format!("publish_{}", instance_id),
            config,
        }
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            log::debug!("connection state {:?} -> {:?}", prev, next);
        }
    }
}

struct Inner {
    shared: Arc<Shared>,
    instance_id: String,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Client-side gateway over one persistent connection.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Open a WebSocket connection to `config.ws_url()` and start the reader loop.
    pub async fn connect(config: GatewayConfig) -> Result<Self, GatewayError> {
        let connector = Arc::new(WsConnector::new(config.ws_url()));
        log::info!("opening gateway connection to {}", connector.url());
        Self::connect_with(config, connector).await
    }

    /// Like `connect`, with a custom transport. The connector is reused for reconnects.
    pub async fn connect_with(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, GatewayError> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        log::debug!("gateway {} connecting", instance_id);
        let shared = Arc::new(Shared::new(config, &instance_id));
        shared.set_state(ConnectionState::Connecting);
        let conn = match connector.connect().await {
            Ok(c) => c,
            Err(e) => {
                log::error!("connect failed: {}", e);
                shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        shared.set_state(ConnectionState::Connected);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reader::run(
            shared.clone(),
            connector,
            conn,
            outbound_rx,
            shutdown_rx,
        ));
        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                instance_id,
                outbound,
                shutdown,
                reader: Mutex::new(Some(handle)),
            }),
        })
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared().config
    }

    /// Unique id of this gateway instance.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Request id carried by this instance's state publications.
    pub fn publish_request_id(&self) -> &str {
        &self.shared().publish_request_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared().state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared().state.subscribe()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> ConnectionState {
        let mut rx = self.watch_state();
        let state = match rx.wait_for(|s| *s == target).await {
            Ok(s) => *s,
            Err(_) => self.state(),
        };
        state
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared().correlator.len()
    }

    /// Queue an envelope for the writer. Refused unless connected.
    fn enqueue(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(GatewayError::Send(format!("not connected ({:?})", state)));
        }
        let text = serde_json::to_string(envelope)?;
        log::debug!("posting {} request {}", envelope.kind(), envelope.request_id);
        self.inner
            .outbound
            .send(Frame::Text(text))
            .map_err(|_| GatewayError::Send("reader loop stopped".to_string()))
    }

    /// Submit with the configured default deadline. The response is returned as received,
    /// including a non-200 status; see `request` for the error-raising variant.
    pub async fn submit(&self, envelope: Envelope) -> Result<Response, GatewayError> {
        let deadline = self.config().request_timeout();
        self.submit_with_deadline(envelope, deadline).await
    }

    /// Submit and await the matching response. An empty request id is replaced by a fresh
    /// one; a caller-supplied id must not already be in flight. With a deadline, the pending
    /// entry is removed on expiry and `GatewayError::Timeout` returned. Dropping the returned
    /// future also removes it.
    pub async fn submit_with_deadline(
        &self,
        mut envelope: Envelope,
        deadline: Option<Duration>,
    ) -> Result<Response, GatewayError> {
        if envelope.request_id.trim().is_empty() {
            envelope.request_id = new_request_id();
        }
        let waiter = self
            .shared()
            .correlator
            .register_waiter(&envelope.request_id, envelope.kind())?;
        self.enqueue(&envelope)?;
        waiter.wait(deadline).await
    }

    /// `submit`, with a non-200 status turned into `GatewayError::Service`.
    pub async fn request(&self, envelope: Envelope) -> Result<Response, GatewayError> {
        self.submit(envelope).await?.into_result()
    }

    /// Submit an arbitrary envelope under a freshly generated request id.
    pub async fn query(&self, envelope: Envelope) -> Result<Response, GatewayError> {
        self.submit(envelope.with_request_id(new_request_id())).await
    }

    /// Fire-and-forget. The response is consumed by the correlator and a failure is logged.
    /// Returns the request id used.
    pub async fn post(&self, mut envelope: Envelope) -> Result<String, GatewayError> {
        if envelope.request_id.trim().is_empty() {
            envelope.request_id = new_request_id();
        }
        let correlator = &self.shared().correlator;
        correlator.register_detached(&envelope.request_id, envelope.kind())?;
        if let Err(e) = self.enqueue(&envelope) {
            correlator.cancel(&envelope.request_id);
            return Err(e);
        }
        Ok(envelope.request_id)
    }

    /// Fire-and-forget under this instance's publication id. Neither the response nor the
    /// resulting notification is routed back to this gateway's subscriptions.
    pub async fn publish(&self, envelope: Envelope) -> Result<(), GatewayError> {
        let envelope = envelope.with_request_id(self.publish_request_id());
        self.enqueue(&envelope)
    }

    /// Fetch one document by id.
    pub async fn get(&self, index: &str, collection: &str, id: &str) -> Result<Response, GatewayError> {
        self.submit(
            Request::Get {
                index: index.to_string(),
                collection: collection.to_string(),
                id: id.to_string(),
            }
            .into(),
        )
        .await
    }

    /// Watch documents of `index/collection` whose subject field equals `subject`.
    ///
    /// The first subscriber of a topic makes the server subscription and waits for its
    /// response; later ones wait for that same answer. A non-200 answer is returned to every
    /// one of them as an error and nothing stays registered.
    pub async fn subscribe(
        &self,
        index: &str,
        collection: &str,
        subject: &str,
    ) -> Result<Subscription, GatewayError> {
        let (sub, arrival) = self.shared().router.add(index, collection, subject);
        let claim = match arrival {
            Arrival::Joined(ready) => {
                router::joined(ready).await?;
                return Ok(sub);
            }
            Arrival::First(claim) => claim,
        };
        let request = Request::Subscribe {
            index: index.to_string(),
            collection: collection.to_string(),
            filter: equals_filter(&self.config().subject_field, subject),
        };
        match self.request(request.into()).await {
            Ok(res) => {
                let room = res.room_id().map(str::to_string);
                log::info!("subscribed to {}/{}/{} (room {:?})", index, collection, subject, room);
                claim.ready(room);
                Ok(sub)
            }
            Err(e) => {
                log::warn!("subscribe to {} failed: {}", subject, e);
                claim.fail(&e);
                Err(e)
            }
        }
    }

    /// Stop a subscription. The server subscription is released with the last subscriber.
    pub async fn unsubscribe(&self, sub: Subscription) -> Result<(), GatewayError> {
        let removal = self.shared().router.remove(sub.key(), sub.id());
        if let Removal::Last(topic) = removal {
            if let Some(room_id) = topic.room_id {
                if self.state() == ConnectionState::Connected {
                    self.post(Request::Unsubscribe { room_id }.into()).await?;
                }
            }
            log::info!("unsubscribed from {}", topic.subject);
        }
        Ok(())
    }

    /// Caller-initiated disconnect: terminal, no reconnection follows. Pending requests fail
    /// with `GatewayError::Closed` and subscriptions end.
    pub async fn disconnect(&self) -> Result<(), GatewayError> {
        let handle = self.inner.reader.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };
        log::debug!("disconnecting");
        self.shared().set_state(ConnectionState::Disconnecting);
        self.inner.shutdown.send_replace(true);
        handle
            .await
            .map_err(|e| GatewayError::Closed(format!("reader task failed: {}", e)))?;
        log::debug!("disconnected");
        Ok(())
    }
}
