//! Duplex transport to compute hosts.
//!
//! A [`TransportConnector`] yields a pair of text-frame channels. Each open
//! [`Connection`] runs a dispatcher task that decodes inbound frames and
//! routes them by class: handshake acks to the armed handshake waiter, stream
//! messages to the active prompt stream, correlated responses to the pending
//! registry. A connection is bound to exactly one session; the
//! [`ConnectionPool`] tears it down and reopens it when another session
//! claims the same endpoint.

mod ws;

pub use ws::WsConnector;

use crate::encryption::EncryptionContext;
use crate::error::EngineError;
use crate::pending::{FailReason, PendingRegistry};
use async_trait::async_trait;
use log::{debug, info, warn};
use meterlink_protocol::{ClientMessage, HostMessage, MessageClass, RequestId, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Raw text-frame channels of an open transport.
pub struct Duplex {
    /// Frames to the host; dropping the sender closes the transport.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames from the host; ends when the transport closes.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens duplex transports to host endpoints.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Duplex, EngineError>;
}

struct StreamRoute {
    request_id: RequestId,
    sender: mpsc::UnboundedSender<HostMessage>,
}

#[derive(Default)]
struct RouteTable {
    handshake: Option<oneshot::Sender<HostMessage>>,
    stream: Option<StreamRoute>,
    closed: bool,
}

/// Routing state shared by a connection and its dispatcher task.
struct Router {
    session_id: SessionId,
    table: Mutex<RouteTable>,
    pending: Arc<PendingRegistry>,
}

impl Router {
    fn new(session_id: SessionId, pending: Arc<PendingRegistry>) -> Self {
        Self {
            session_id,
            table: Mutex::new(RouteTable::default()),
            pending,
        }
    }

    fn route(&self, message: HostMessage) {
        match message.class() {
            MessageClass::Ignored => debug!(
                "ignoring host message (session_id={}, type={})",
                self.session_id,
                message.type_name()
            ),
            MessageClass::Handshake => self.route_handshake(message),
            MessageClass::Stream => {
                if !self.route_stream(message) {
                    debug!(
                        "dropping stream message without listener (session_id={})",
                        self.session_id
                    );
                }
            }
            MessageClass::Correlated => {
                if let Some(request_id) = message.correlation_id().cloned()
                    && !self.pending.resolve(&request_id, message)
                {
                    debug!(
                        "late or unknown correlated response (session_id={}, request_id={})",
                        self.session_id, request_id
                    );
                }
            }
            MessageClass::Failure => self.route_failure(message),
        }
    }

    fn route_handshake(&self, message: HostMessage) {
        if let HostMessage::SessionInitAck {
            session_id: Some(acked),
            ..
        } = &message
            && *acked != self.session_id
        {
            warn!(
                "dropping handshake ack for another session (session_id={}, acked={})",
                self.session_id, acked
            );
            return;
        }
        match self.table.lock().handshake.take() {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => debug!("unsolicited handshake ack (session_id={})", self.session_id),
        }
    }

    /// Deliver to the active stream when the correlation id matches.
    fn route_stream(&self, message: HostMessage) -> bool {
        let table = self.table.lock();
        let Some(route) = table.stream.as_ref() else {
            return false;
        };
        if let Some(id) = message.correlation_id()
            && *id != route.request_id
        {
            debug!(
                "dropping stale stream message (session_id={}, request_id={}, active={})",
                self.session_id, id, route.request_id
            );
            return false;
        }
        route.sender.send(message).is_ok()
    }

    /// Errors go to the pending request they name, else the armed handshake,
    /// else the active stream.
    fn route_failure(&self, message: HostMessage) {
        if let Some(request_id) = message.correlation_id()
            && self
                .pending
                .reject(request_id, EngineError::from_host_message(&message))
        {
            return;
        }
        let waiter = self.table.lock().handshake.take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(message);
            return;
        }
        if !self.route_stream(message) {
            warn!(
                "host error with no waiting operation (session_id={})",
                self.session_id
            );
        }
    }

    fn arm_handshake(&self) -> oneshot::Receiver<HostMessage> {
        let (sender, receiver) = oneshot::channel();
        self.table.lock().handshake = Some(sender);
        receiver
    }

    fn disarm_handshake(&self) {
        self.table.lock().handshake = None;
    }

    fn open_stream(&self, request_id: RequestId) -> mpsc::UnboundedReceiver<HostMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.table.lock().stream = Some(StreamRoute { request_id, sender });
        receiver
    }

    fn clear_stream(&self, request_id: &RequestId) {
        let mut table = self.table.lock();
        if table
            .stream
            .as_ref()
            .is_some_and(|route| &route.request_id == request_id)
        {
            table.stream = None;
        }
    }

    fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    /// Drop every route and fail the session's outstanding requests.
    fn shut(&self) {
        {
            let mut table = self.table.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            table.handshake = None;
            table.stream = None;
        }
        let failed = self
            .pending
            .fail_session(self.session_id, FailReason::ConnectionClosed);
        if failed > 0 {
            warn!(
                "connection closed with requests outstanding (session_id={}, failed={})",
                self.session_id, failed
            );
        }
    }
}

async fn dispatch(router: Arc<Router>, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = inbound.recv().await {
        match HostMessage::parse(&frame) {
            Ok(message) => router.route(message),
            Err(err) => warn!(
                "discarding malformed host frame (session_id={}, err={})",
                router.session_id, err
            ),
        }
    }
    debug!("inbound transport closed (session_id={})", router.session_id);
    router.shut();
}

/// Receiving end of one prompt stream. Dropping it detaches the route.
pub(crate) struct StreamSubscription {
    router: Arc<Router>,
    request_id: RequestId,
    pub(crate) receiver: mpsc::UnboundedReceiver<HostMessage>,
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.router.clear_stream(&self.request_id);
    }
}

/// One open transport bound to one session.
pub(crate) struct Connection {
    endpoint: String,
    router: Arc<Router>,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    pub(crate) encryption: EncryptionContext,
    /// Plaintext `session_init` already sent on this connection.
    pub(crate) initialized: bool,
}

impl Connection {
    pub(crate) async fn open(
        connector: &dyn TransportConnector,
        endpoint: &str,
        session_id: SessionId,
        pending: Arc<PendingRegistry>,
    ) -> Result<Self, EngineError> {
        let Duplex { outbound, inbound } = connector.connect(endpoint).await?;
        let router = Arc::new(Router::new(session_id, pending));
        let reader = tokio::spawn(dispatch(router.clone(), inbound));
        info!(
            "connection opened (session_id={}, endpoint={})",
            session_id, endpoint
        );
        Ok(Self {
            endpoint: endpoint.to_string(),
            router,
            outbound,
            reader,
            encryption: EncryptionContext::default(),
            initialized: false,
        })
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.router.session_id
    }

    pub(crate) fn send(&self, message: &ClientMessage) -> Result<(), EngineError> {
        let frame = message.to_frame()?;
        self.outbound
            .send(frame)
            .map_err(|_| EngineError::Transport(format!("connection to {} is closed", self.endpoint)))?;
        debug!(
            "frame sent (session_id={}, type={})",
            self.session_id(),
            message.type_name()
        );
        Ok(())
    }

    /// Register the waiter for the next `session_init_ack` or error.
    pub(crate) fn arm_handshake(&self) -> oneshot::Receiver<HostMessage> {
        self.router.arm_handshake()
    }

    pub(crate) fn disarm_handshake(&self) {
        self.router.disarm_handshake();
    }

    /// Route stream messages for `request_id` to a new subscription.
    pub(crate) fn open_stream(&self, request_id: RequestId) -> StreamSubscription {
        let receiver = self.router.open_stream(request_id.clone());
        StreamSubscription {
            router: self.router.clone(),
            request_id,
            receiver,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.outbound.is_closed() || self.router.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.router.shut();
        debug!(
            "connection closed (session_id={}, endpoint={})",
            self.router.session_id, self.endpoint
        );
    }
}

/// Exclusive access to a session's connection for one operation.
pub(crate) type ConnectionLease = OwnedMappedMutexGuard<Option<Connection>, Connection>;

type Slot = Arc<AsyncMutex<Option<Connection>>>;

/// One connection slot per endpoint, rebound as sessions change.
pub(crate) struct ConnectionPool {
    connector: Arc<dyn TransportConnector>,
    pending: Arc<PendingRegistry>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionPool {
    pub(crate) fn new(connector: Arc<dyn TransportConnector>, pending: Arc<PendingRegistry>) -> Self {
        Self {
            connector,
            pending,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, endpoint: &str) -> Slot {
        self.slots
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }

    /// Lease the endpoint's connection for `session_id`, rebinding it when it
    /// belongs to another session or has closed. Leases are exclusive, so
    /// operations on one endpoint run one at a time.
    pub(crate) async fn lease(
        &self,
        endpoint: &str,
        session_id: SessionId,
    ) -> Result<ConnectionLease, EngineError> {
        let mut guard = self.slot(endpoint).lock_owned().await;
        let reusable = guard
            .as_ref()
            .is_some_and(|connection| connection.session_id() == session_id && !connection.is_closed());
        if !reusable {
            if let Some(stale) = guard.take() {
                info!(
                    "rebinding connection (endpoint={}, from_session={}, to_session={}, closed={})",
                    endpoint,
                    stale.session_id(),
                    session_id,
                    stale.is_closed()
                );
            }
            let connection =
                Connection::open(self.connector.as_ref(), endpoint, session_id, self.pending.clone())
                    .await?;
            *guard = Some(connection);
        }
        OwnedMutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| EngineError::Transport(format!("no connection available for {endpoint}")))
    }

    /// Close the endpoint's connection if it is bound to `session_id`.
    pub(crate) async fn release(&self, endpoint: &str, session_id: SessionId) -> bool {
        let mut guard = self.slot(endpoint).lock_owned().await;
        if guard
            .as_ref()
            .is_some_and(|connection| connection.session_id() == session_id)
        {
            guard.take();
            return true;
        }
        false
    }

    /// Session currently bound to the endpoint, if any.
    #[cfg(test)]
    pub(crate) async fn bound_session(&self, endpoint: &str) -> Option<SessionId> {
        self.slot(endpoint)
            .lock()
            .await
            .as_ref()
            .map(Connection::session_id)
    }
}
