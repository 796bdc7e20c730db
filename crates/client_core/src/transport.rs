use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use shared::{
    domain::UserId,
    protocol::{events, EventEnvelope, RegisterUserPayload},
};
use tokio::{
    sync::{broadcast, mpsc, mpsc::error::TrySendError},
    task::AbortHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ReconnectPolicy,
    credentials::Credential,
    error::{ChatError, Result},
};

const LINK_CHANNEL_CAPACITY: usize = 256;

pub type EventHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Produces frames that must reach a new link right after `registerUser`,
/// ahead of anything queued while offline.
pub type LinkOpener = Arc<dyn Fn() -> Vec<EventEnvelope> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Handed to the live connection.
    Sent,
    /// Held in the outbound queue until the next successful connect.
    Queued,
    /// The outbound queue was full; the frame is gone.
    Dropped,
}

#[derive(Debug)]
pub enum TransportSignal {
    Event(EventEnvelope),
    Closed { reason: String },
}

/// Channel pair bridging one physical connection. Dropping `outbound`
/// closes the connection; `inbound` ends with `Closed` or by closing.
pub struct TransportLink {
    pub outbound: mpsc::Sender<EventEnvelope>,
    pub inbound: mpsc::Receiver<TransportSignal>,
    pub abort: Option<AbortHandle>,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, credential: &Credential) -> Result<TransportLink>;
}

/// JSON envelopes over a WebSocket. The bearer token travels in the
/// `Authorization` header of the upgrade request.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn open(&self, credential: &Credential) -> Result<TransportLink> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::Validation(format!("invalid realtime url {}: {e}", self.url)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|e| ChatError::Validation(format!("session token is not header-safe: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ChatError::Transport(format!("failed to connect websocket {}: {e}", self.url)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<EventEnvelope>(LINK_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportSignal>(LINK_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = %envelope.event, "realtime: failed to encode frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("realtime: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<EventEnvelope>(&text) {
                            Ok(envelope) => {
                                if inbound_tx.send(TransportSignal::Event(envelope)).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => warn!("realtime: invalid server frame: {err}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|frame| frame.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("websocket receive failed: {err}"),
                    None => break "websocket stream ended".to_string(),
                }
            };
            let _ = inbound_tx.send(TransportSignal::Closed { reason }).await;
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            abort: Some(reader.abort_handle()),
        })
    }
}

struct ConnectionInner {
    state: ConnectionState,
    generation: u64,
    /// Bumped by `shutdown`; handles from an older epoch no longer own a
    /// reference.
    epoch: u64,
    references: usize,
    credential: Option<Credential>,
    outbound: Option<mpsc::Sender<EventEnvelope>>,
    pump: Option<AbortHandle>,
    link_abort: Option<AbortHandle>,
    reconnect_task: Option<AbortHandle>,
    pending: VecDeque<EventEnvelope>,
    handlers: HashMap<String, Vec<(HandlerId, EventHandler)>>,
    openers: Vec<(HandlerId, LinkOpener)>,
}

/// Owns the single realtime connection shared by every open conversation.
///
/// Each successful [`connect`](Self::connect) takes a reference and each
/// [`disconnect`](Self::disconnect) releases one; the socket closes when the
/// last reference goes away.
pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    reconnect: ReconnectPolicy,
    queue_capacity: usize,
    connect_gate: tokio::sync::Mutex<()>,
    inner: Mutex<ConnectionInner>,
    next_handler_id: AtomicU64,
    state_tx: broadcast::Sender<ConnectionState>,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    manager: Arc<ConnectionManager>,
    connection_id: u64,
    epoch: u64,
}

impl ConnectionHandle {
    /// Identifier of the physical connection this handle was issued on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// False once the manager was shut down after this handle was issued.
    pub fn is_current(&self) -> bool {
        self.manager.inner.lock().epoch == self.epoch
    }

    /// Releases the reference this handle was issued with. A no-op for
    /// handles that predate a shutdown.
    pub fn disconnect(&self) {
        self.manager.release(Some(self.epoch));
    }

    pub fn emit(&self, event: &str, payload: serde_json::Value) -> EmitOutcome {
        self.manager.emit(event, payload)
    }

    pub fn emit_payload<T: Serialize>(&self, event: &str, payload: &T) -> EmitOutcome {
        self.manager.emit_payload(event, payload)
    }

    pub fn on_event(&self, event: &str, handler: EventHandler) -> HandlerId {
        self.manager.on_event(event, handler)
    }

    pub fn off_event(&self, id: HandlerId) -> bool {
        self.manager.off_event(id)
    }
}

/// Resets a `Connecting` state if the connect future is dropped mid-flight.
struct ConnectingGuard<'a> {
    manager: &'a ConnectionManager,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("realtime: connect cancelled before completion");
            self.manager.set_state(ConnectionState::Disconnected);
        }
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        reconnect: ReconnectPolicy,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            connector,
            reconnect,
            queue_capacity,
            connect_gate: tokio::sync::Mutex::new(()),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                generation: 0,
                epoch: 0,
                references: 0,
                credential: None,
                outbound: None,
                pump: None,
                link_abort: None,
                reconnect_task: None,
                pending: VecDeque::new(),
                handlers: HashMap::new(),
                openers: Vec::new(),
            }),
            next_handler_id: AtomicU64::new(1),
            state_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn references(&self) -> usize {
        self.inner.lock().references
    }

    pub fn queued_frames(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Returns the live connection if there is one, otherwise opens it.
    /// Concurrent callers share a single underlying connection.
    pub async fn connect(self: &Arc<Self>, credential: &Credential) -> Result<ConnectionHandle> {
        let _gate = self.connect_gate.lock().await;
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connected {
                let bound_user = inner.credential.as_ref().map(|c| c.user_id);
                if bound_user != Some(credential.user_id) {
                    return Err(ChatError::Validation(format!(
                        "connection is bound to user {:?}; shut it down before switching users",
                        bound_user
                    )));
                }
                inner.references += 1;
                debug!(
                    references = inner.references,
                    connection_id = inner.generation,
                    "realtime: reusing live connection"
                );
                return Ok(ConnectionHandle {
                    manager: Arc::clone(self),
                    connection_id: inner.generation,
                    epoch: inner.epoch,
                });
            }
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            inner.credential = Some(credential.clone());
        }

        self.set_state(ConnectionState::Connecting);
        let mut guard = ConnectingGuard {
            manager: &**self,
            armed: true,
        };
        let opened = self.connector.open(credential).await;
        guard.armed = false;

        let connection_id = match opened.and_then(|link| self.install_link(link, credential.user_id)) {
            Ok(connection_id) => connection_id,
            Err(err) => {
                error!(user_id = credential.user_id.0, "realtime: connect failed: {err}");
                self.set_state(ConnectionState::Failed);
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let (references, epoch) = {
            let mut inner = self.inner.lock();
            inner.references += 1;
            (inner.references, inner.epoch)
        };
        info!(
            user_id = credential.user_id.0,
            connection_id,
            references,
            "realtime: connected"
        );
        Ok(ConnectionHandle {
            manager: Arc::clone(self),
            connection_id,
            epoch,
        })
    }

    /// Sends `registerUser`, then the frames of every link opener, then the
    /// queued frames in order, and starts dispatching inbound events.
    fn install_link(self: &Arc<Self>, link: TransportLink, user_id: UserId) -> Result<u64> {
        let register = EventEnvelope::encode(events::REGISTER_USER, &RegisterUserPayload { user_id })?;
        let openers: Vec<LinkOpener> = self
            .inner
            .lock()
            .openers
            .iter()
            .map(|(_, opener)| Arc::clone(opener))
            .collect();
        let mut preamble = vec![register];
        preamble.extend(openers.iter().flat_map(|opener| opener()));

        let TransportLink {
            outbound,
            inbound,
            abort,
        } = link;

        let connection_id = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            let connection_id = inner.generation;

            let queued = inner.pending.len();
            for frame in preamble.into_iter().rev() {
                inner.pending.push_front(frame);
            }
            inner.outbound = Some(outbound);
            if !drain_pending(&mut inner) {
                warn!(
                    remaining = inner.pending.len(),
                    connection_id, "realtime: link saturated while flushing outbound queue"
                );
            }
            if queued > 0 {
                info!(
                    queued,
                    remaining = inner.pending.len(),
                    connection_id,
                    "realtime: flushed queued frames"
                );
            }

            let manager = Arc::clone(self);
            let pump = tokio::spawn(async move {
                manager.pump_inbound(connection_id, inbound).await;
            });
            if let Some(old) = inner.pump.replace(pump.abort_handle()) {
                old.abort();
            }
            if let Some(old) = std::mem::replace(&mut inner.link_abort, abort) {
                old.abort();
            }
            inner.state = ConnectionState::Connected;
            connection_id
        };

        let _ = self.state_tx.send(ConnectionState::Connected);
        self.dispatch(events::CONNECT, &json!({ "connectionId": connection_id }));
        Ok(connection_id)
    }

    async fn pump_inbound(self: Arc<Self>, connection_id: u64, mut inbound: mpsc::Receiver<TransportSignal>) {
        let reason = loop {
            match inbound.recv().await {
                Some(TransportSignal::Event(envelope)) => {
                    debug!(event = %envelope.event, "realtime: inbound event");
                    self.dispatch(&envelope.event, &envelope.payload);
                }
                Some(TransportSignal::Closed { reason }) => break reason,
                None => break "transport link closed".to_string(),
            }
        };
        self.handle_link_lost(connection_id, &reason);
    }

    fn handle_link_lost(self: &Arc<Self>, connection_id: u64, reason: &str) {
        let should_reconnect = {
            let mut inner = self.inner.lock();
            if inner.generation != connection_id || inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.outbound = None;
            inner.pump = None;
            if let Some(abort) = inner.link_abort.take() {
                abort.abort();
            }
            self.reconnect.enabled && inner.references > 0
        };

        warn!(connection_id, "realtime: connection lost: {reason}");
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        self.dispatch(events::DISCONNECT, &json!({ "reason": reason }));

        if should_reconnect {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move { manager.reconnect_loop().await });
        if let Some(previous) = self.inner.lock().reconnect_task.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let max_attempts = self.reconnect.max_attempts;
        for attempt in 0..max_attempts {
            tokio::time::sleep(self.reconnect.delay_for_attempt(attempt)).await;

            let _gate = self.connect_gate.lock().await;
            let credential = {
                let inner = self.inner.lock();
                if inner.references == 0 || inner.state == ConnectionState::Connected {
                    return;
                }
                match inner.credential.clone() {
                    Some(credential) => credential,
                    None => return,
                }
            };

            info!(attempt = attempt + 1, max_attempts, "realtime: reconnect attempt");
            self.set_state(ConnectionState::Connecting);
            let result = self
                .connector
                .open(&credential)
                .await
                .and_then(|link| self.install_link(link, credential.user_id));
            match result {
                Ok(connection_id) => {
                    info!(connection_id, attempt = attempt + 1, "realtime: reconnected");
                    return;
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, "realtime: reconnect failed: {err}");
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }

        error!(max_attempts, "realtime: giving up on reconnect");
        self.set_state(ConnectionState::Failed);
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
        let _ = self.state_tx.send(state);
    }

    /// Never fails: frames go out, wait in the queue, or are dropped when the
    /// queue is full. Frames never overtake ones queued earlier.
    pub fn emit(&self, event: &str, payload: serde_json::Value) -> EmitOutcome {
        let mut envelope = EventEnvelope::new(event, payload);
        let mut inner = self.inner.lock();

        if inner.state == ConnectionState::Connected && drain_pending(&mut inner) {
            if let Some(outbound) = &inner.outbound {
                match outbound.try_send(envelope) {
                    Ok(()) => {
                        debug!(event, "realtime: emitted");
                        return EmitOutcome::Sent;
                    }
                    Err(TrySendError::Full(returned) | TrySendError::Closed(returned)) => {
                        envelope = returned;
                    }
                }
            }
        }

        if inner.pending.len() >= self.queue_capacity {
            warn!(
                event,
                capacity = self.queue_capacity,
                "realtime: outbound queue full; dropping frame"
            );
            return EmitOutcome::Dropped;
        }
        inner.pending.push_back(envelope);
        debug!(event, queued = inner.pending.len(), "realtime: frame queued");
        EmitOutcome::Queued
    }

    pub fn emit_payload<T: Serialize>(&self, event: &str, payload: &T) -> EmitOutcome {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit(event, value),
            Err(err) => {
                error!(event, "realtime: failed to encode payload: {err}");
                EmitOutcome::Dropped
            }
        }
    }

    /// Handlers for the same event run in registration order.
    pub fn on_event(&self, event: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .lock()
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Registers frames to replay on every new link before queued frames
    /// are flushed. Removed with [`off_event`](Self::off_event).
    pub fn on_link_open(&self, opener: LinkOpener) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().openers.push((id, opener));
        id
    }

    pub fn off_event(&self, id: HandlerId) -> bool {
        let mut inner = self.inner.lock();
        let mut removed = false;
        inner.handlers.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(handler_id, _)| *handler_id != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        let before = inner.openers.len();
        inner.openers.retain(|(opener_id, _)| *opener_id != id);
        removed | (inner.openers.len() != before)
    }

    fn dispatch(&self, event: &str, payload: &serde_json::Value) {
        let handlers: Vec<EventHandler> = self
            .inner
            .lock()
            .handlers
            .get(event)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(payload);
        }
    }

    /// Releases one reference; closes the connection once none remain.
    pub fn disconnect(&self) {
        self.release(None);
    }

    fn release(&self, epoch: Option<u64>) {
        {
            let mut inner = self.inner.lock();
            if epoch.is_some_and(|epoch| epoch != inner.epoch) {
                debug!("realtime: ignoring release from a handle issued before shutdown");
                return;
            }
            if inner.references == 0 {
                debug!("realtime: disconnect with no outstanding references");
                return;
            }
            inner.references -= 1;
            if inner.references > 0 {
                debug!(references = inner.references, "realtime: connection still referenced");
                return;
            }
        }
        self.close("last reference released");
    }

    /// Closes regardless of outstanding references and discards queued
    /// frames. Used on logout.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            inner.references = 0;
            inner.pending.clear();
            inner.credential = None;
        }
        self.close("shutdown");
    }

    fn close(&self, reason: &str) {
        let was_connected = {
            let mut inner = self.inner.lock();
            if let Some(task) = inner.reconnect_task.take() {
                task.abort();
            }
            if let Some(task) = inner.pump.take() {
                task.abort();
            }
            if let Some(abort) = inner.link_abort.take() {
                abort.abort();
            }
            inner.outbound = None;
            let was_connected = inner.state == ConnectionState::Connected;
            inner.state = ConnectionState::Disconnected;
            was_connected
        };

        let _ = self.state_tx.send(ConnectionState::Disconnected);
        if was_connected {
            info!("realtime: connection closed: {reason}");
            self.dispatch(events::DISCONNECT, &json!({ "reason": reason }));
        }
    }
}

/// Moves queued frames onto the live link in order. Returns false when
/// there is no link or it filled up before the queue emptied.
fn drain_pending(inner: &mut ConnectionInner) -> bool {
    let Some(outbound) = inner.outbound.as_ref() else {
        return false;
    };
    while let Some(frame) = inner.pending.pop_front() {
        if let Err(err) = outbound.try_send(frame) {
            let (TrySendError::Full(frame) | TrySendError::Closed(frame)) = err;
            inner.pending.push_front(frame);
            return false;
        }
    }
    true
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
