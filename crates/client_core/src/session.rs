use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use shared::{
    domain::{ClientMessageId, ConversationId, UserId},
    error::ErrorCode,
    protocol::{events, ErrorPayload, MessagePayload, SendMessagePayload},
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::AbortHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    api::BackendClient,
    config::ClientSettings,
    credentials::{Credential, CredentialProvider, FileKeyValueStore},
    error::{ChatError, Result},
    history::HistorySource,
    rooms::{ConversationRoom, RoomBinder},
    store::{Message, MessageStore},
    transport::{
        ConnectionHandle, ConnectionManager, ConnectionState, EmitOutcome, HandlerId,
        WebSocketConnector,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for whatever renders the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    MessagesChanged {
        conversation_id: ConversationId,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        count: usize,
    },
    HistoryFailed {
        conversation_id: ConversationId,
        error: ChatError,
    },
    MessageFailed {
        conversation_id: ConversationId,
        local_id: ClientMessageId,
    },
    /// The server rejected a frame over the realtime `error` event.
    ServerError {
        code: ErrorCode,
        message: String,
        conversation_id: Option<ConversationId>,
    },
}

/// Entry point of the client: owns the credential provider, the shared
/// realtime connection and the room binder, and opens conversations on
/// top of them.
pub struct SessionManager {
    credentials: CredentialProvider,
    connection: Arc<ConnectionManager>,
    binder: Arc<RoomBinder>,
    history: Arc<dyn HistorySource>,
    events: broadcast::Sender<SessionEvent>,
    state_forwarder: AbortHandle,
    error_handler: HandlerId,
}

impl SessionManager {
    /// Must be called from within a tokio runtime.
    pub fn new(
        credentials: CredentialProvider,
        connection: Arc<ConnectionManager>,
        history: Arc<dyn HistorySource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let binder = Arc::new(RoomBinder::new(Arc::clone(&connection)));

        let mut states = connection.subscribe_state();
        let forward = events.clone();
        let state_forwarder = tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(state) => {
                        let _ = forward.send(SessionEvent::ConnectionChanged(state));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: connection state updates lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
        .abort_handle();

        let error_events = events.clone();
        let error_handler = connection.on_event(
            events::ERROR,
            Arc::new(move |payload: &serde_json::Value| {
                let Some(rejection) = decode_error(payload) else {
                    return;
                };
                warn!(
                    code = ?rejection.error.code,
                    conversation_id = rejection.conversation_id.map(|id| id.0),
                    "session: server rejected a frame: {}",
                    rejection.error.message
                );
                let _ = error_events.send(SessionEvent::ServerError {
                    code: rejection.error.code,
                    message: rejection.error.message,
                    conversation_id: rejection.conversation_id,
                });
            }),
        );

        Self {
            credentials,
            connection,
            binder,
            history,
            events,
            state_forwarder,
            error_handler,
        }
    }

    /// Production wiring: file-backed credentials, WebSocket transport and
    /// the REST backend as history source.
    pub fn from_settings(settings: &ClientSettings, backend: BackendClient) -> Self {
        let store = Arc::new(FileKeyValueStore::new(settings.storage_path.clone()));
        let connection = ConnectionManager::new(
            Arc::new(WebSocketConnector::new(settings.realtime_url.clone())),
            settings.reconnect,
            settings.outbound_queue_capacity,
        );
        Self::new(CredentialProvider::new(store), connection, Arc::new(backend))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn credentials(&self) -> &CredentialProvider {
        &self.credentials
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.binder.active()
    }

    /// Persists the credential returned by the backend login.
    pub async fn login(&self, credential: &Credential) -> Result<()> {
        if let Ok(previous) = self.credentials.get_credential().await {
            if previous.user_id != credential.user_id {
                info!(
                    previous = previous.user_id.0,
                    next = credential.user_id.0,
                    "session: switching users"
                );
                self.binder.reset();
                self.connection.shutdown();
            }
        }
        self.credentials.store_credential(credential).await
    }

    /// Forgets the credential and closes the connection regardless of open
    /// conversations.
    pub async fn logout(&self) -> Result<()> {
        self.binder.reset();
        self.connection.shutdown();
        self.credentials.clear().await?;
        info!("session: logged out");
        Ok(())
    }

    pub async fn open_conversation(&self, room: &ConversationRoom) -> Result<ConversationSession> {
        let conversation_id = room.conversation_id();
        let credential = self.credentials.get_credential().await?;
        if !room.includes(credential.user_id) {
            return Err(ChatError::Validation(format!(
                "user {} is not a participant of conversation {conversation_id}",
                credential.user_id
            )));
        }

        let handle = self.connection.connect(&credential).await?;
        if let Err(err) = self.binder.join(conversation_id) {
            handle.disconnect();
            return Err(err);
        }

        let shared = Arc::new(SessionShared {
            conversation_id,
            events: self.events.clone(),
            binder: Arc::downgrade(&self.binder),
            state: Mutex::new(SessionState {
                store: MessageStore::new(conversation_id, credential.user_id),
                buffered: Vec::new(),
                seeded: false,
                closed: false,
            }),
        });

        let listener = Arc::clone(&shared);
        let message_handler = self.connection.on_event(
            events::NEW_MESSAGE,
            Arc::new(move |payload: &serde_json::Value| listener.on_new_message(payload)),
        );
        let listener = Arc::clone(&shared);
        let error_handler = self.connection.on_event(
            events::ERROR,
            Arc::new(move |payload: &serde_json::Value| listener.on_server_error(payload)),
        );

        let history_task = tokio::spawn(load_history(
            Arc::clone(&shared),
            Arc::clone(&self.history),
            credential.clone(),
        ))
        .abort_handle();

        info!(
            conversation_id = conversation_id.0,
            connection_id = handle.connection_id(),
            "session: conversation opened"
        );
        Ok(ConversationSession {
            shared,
            handle,
            binder: Arc::clone(&self.binder),
            sender_id: credential.user_id,
            handlers: [message_handler, error_handler],
            history_task: Mutex::new(Some(history_task)),
        })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.state_forwarder.abort();
        self.connection.off_event(self.error_handler);
    }
}

fn decode_error(payload: &serde_json::Value) -> Option<ErrorPayload> {
    match serde_json::from_value(payload.clone()) {
        Ok(rejection) => Some(rejection),
        Err(err) => {
            warn!("session: invalid error payload: {err}");
            None
        }
    }
}

struct SessionState {
    store: MessageStore,
    /// Live messages that arrived before the history was applied.
    buffered: Vec<MessagePayload>,
    seeded: bool,
    closed: bool,
}

struct SessionShared {
    conversation_id: ConversationId,
    events: broadcast::Sender<SessionEvent>,
    binder: Weak<RoomBinder>,
    state: Mutex<SessionState>,
}

impl SessionShared {
    fn on_new_message(&self, payload: &serde_json::Value) {
        let message: MessagePayload = match serde_json::from_value(payload.clone()) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    conversation_id = self.conversation_id.0,
                    "session: invalid newMessage payload: {err}"
                );
                return;
            }
        };
        if message.conversation_id != self.conversation_id {
            return;
        }
        let active = self
            .binder
            .upgrade()
            .is_some_and(|binder| binder.is_active(self.conversation_id));
        if !active {
            debug!(
                conversation_id = self.conversation_id.0,
                "session: message for an inactive conversation ignored"
            );
            return;
        }

        let changed = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if !state.seeded {
                state.buffered.push(message);
                debug!(
                    conversation_id = self.conversation_id.0,
                    buffered = state.buffered.len(),
                    "session: live message buffered until history arrives"
                );
                return;
            }
            state.store.reconcile(message).changed()
        };
        if changed {
            self.notify_changed();
        }
    }

    /// Fails the local message a server rejection refers to, if it is ours.
    fn on_server_error(&self, payload: &serde_json::Value) {
        let Ok(rejection) = serde_json::from_value::<ErrorPayload>(payload.clone()) else {
            return;
        };
        let Some(local_id) = rejection.client_message_id else {
            return;
        };
        if rejection
            .conversation_id
            .is_some_and(|id| id != self.conversation_id)
        {
            return;
        }

        let marked = {
            let mut state = self.state.lock();
            !state.closed && state.store.mark_failed(local_id)
        };
        if marked {
            warn!(
                conversation_id = self.conversation_id.0,
                %local_id,
                "session: message rejected by server"
            );
            self.notify_changed();
            let _ = self.events.send(SessionEvent::MessageFailed {
                conversation_id: self.conversation_id,
                local_id,
            });
        }
    }

    fn notify_changed(&self) {
        let _ = self.events.send(SessionEvent::MessagesChanged {
            conversation_id: self.conversation_id,
        });
    }
}

async fn load_history(
    shared: Arc<SessionShared>,
    history: Arc<dyn HistorySource>,
    credential: Credential,
) {
    let conversation_id = shared.conversation_id;
    let result = history.load(conversation_id, &credential).await;

    let event = {
        let mut state = shared.state.lock();
        if state.closed {
            debug!(
                conversation_id = conversation_id.0,
                "history: session closed before load finished; result discarded"
            );
            return;
        }
        let event = match result {
            Ok(messages) => {
                state.store.reseed(messages);
                SessionEvent::HistoryLoaded {
                    conversation_id,
                    count: state.store.len(),
                }
            }
            Err(error) => {
                error!(conversation_id = conversation_id.0, "history: load failed: {error}");
                SessionEvent::HistoryFailed {
                    conversation_id,
                    error,
                }
            }
        };
        let buffered = std::mem::take(&mut state.buffered);
        for message in buffered {
            state.store.reconcile(message);
        }
        state.seeded = true;
        event
    };

    if let SessionEvent::HistoryLoaded { count, .. } = &event {
        info!(conversation_id = conversation_id.0, count, "history: applied");
    }
    let _ = shared.events.send(event);
    shared.notify_changed();
}

/// One open conversation. Closing it (or dropping it) leaves the room and
/// releases its reference on the shared connection.
pub struct ConversationSession {
    shared: Arc<SessionShared>,
    handle: ConnectionHandle,
    binder: Arc<RoomBinder>,
    sender_id: UserId,
    handlers: [HandlerId; 2],
    history_task: Mutex<Option<AbortHandle>>,
}

impl ConversationSession {
    pub fn conversation_id(&self) -> ConversationId {
        self.shared.conversation_id
    }

    pub fn connection_id(&self) -> u64 {
        self.handle.connection_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Whether the history has been applied (successfully or not).
    pub fn is_seeded(&self) -> bool {
        self.shared.state.lock().seeded
    }

    /// Snapshot of the ordered message list.
    pub fn messages(&self) -> Vec<Message> {
        self.shared.state.lock().store.list().to_vec()
    }

    /// Appends an optimistic message and emits it. A frame the transport
    /// drops leaves the message `Failed`; it can be retried.
    pub fn send(
        &self,
        content: Option<String>,
        attachment_url: Option<String>,
    ) -> Result<ClientMessageId> {
        let (local_id, payload) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ChatError::Validation(format!(
                    "conversation {} is closed",
                    self.shared.conversation_id
                )));
            }
            let local_id = state
                .store
                .append_local(content, attachment_url, Utc::now())?;
            let payload = state
                .store
                .get(local_id)
                .map(|message| self.outbound_payload(local_id, message));
            (local_id, payload)
        };
        self.shared.notify_changed();

        if let Some(payload) = payload {
            self.dispatch(local_id, &payload);
        }
        Ok(local_id)
    }

    /// Sends a `Failed` message again.
    pub fn retry(&self, local_id: ClientMessageId) -> Result<()> {
        let payload = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ChatError::Validation(format!(
                    "conversation {} is closed",
                    self.shared.conversation_id
                )));
            }
            let message = state.store.requeue(local_id).ok_or_else(|| {
                ChatError::Validation(format!("message {local_id} is not awaiting retry"))
            })?;
            self.outbound_payload(local_id, &message)
        };
        info!(
            conversation_id = self.shared.conversation_id.0,
            %local_id,
            "session: retrying message"
        );
        self.shared.notify_changed();
        self.dispatch(local_id, &payload);
        Ok(())
    }

    fn outbound_payload(&self, local_id: ClientMessageId, message: &Message) -> SendMessagePayload {
        SendMessagePayload {
            conversation_id: self.shared.conversation_id,
            sender_id: self.sender_id,
            content: message.content.clone(),
            image_url: message.attachment_url.clone(),
            client_message_id: local_id,
        }
    }

    fn dispatch(&self, local_id: ClientMessageId, payload: &SendMessagePayload) {
        let outcome = self.handle.emit_payload(events::SEND_MESSAGE, payload);
        if outcome != EmitOutcome::Dropped {
            debug!(
                conversation_id = self.shared.conversation_id.0,
                %local_id,
                ?outcome,
                "session: message handed to transport"
            );
            return;
        }

        let marked = self.shared.state.lock().store.mark_failed(local_id);
        if marked {
            warn!(
                conversation_id = self.shared.conversation_id.0,
                %local_id,
                "session: message could not be sent"
            );
            self.shared.notify_changed();
            let _ = self.shared.events.send(SessionEvent::MessageFailed {
                conversation_id: self.shared.conversation_id,
                local_id,
            });
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.buffered.clear();
            state.store.clear();
        }
        if let Some(task) = self.history_task.lock().take() {
            task.abort();
        }
        for handler in self.handlers {
            self.handle.off_event(handler);
        }

        // Rooms and references of a handle issued before a logout belong to
        // whoever logged in since.
        let conversation_id = self.shared.conversation_id;
        if self.handle.is_current() && self.binder.is_joined(conversation_id) {
            self.binder.leave(conversation_id);
        }
        self.handle.disconnect();
        info!(conversation_id = conversation_id.0, "session: conversation closed");
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
