use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{EventEnvelope, MessagePayload},
};
use tokio::sync::{mpsc, Notify};

use crate::{
    credentials::Credential,
    error::{ChatError, Result},
    history::HistorySource,
    transport::{TransportConnector, TransportLink, TransportSignal},
};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

pub(crate) fn credential(user_id: i64) -> Credential {
    Credential {
        user_id: UserId(user_id),
        token: format!("token-{user_id}"),
    }
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn server_message(
    id: i64,
    conversation_id: i64,
    sender_id: i64,
    content: &str,
    seconds: i64,
) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        content: Some(content.to_string()),
        image_url: None,
        created_at: at(seconds),
        client_message_id: None,
    }
}

/// Server side of one fake connection.
pub(crate) struct FakeRemote {
    pub token: String,
    sent: mpsc::Receiver<EventEnvelope>,
    inbound: mpsc::Sender<TransportSignal>,
}

impl FakeRemote {
    pub async fn next_frame(&mut self) -> EventEnvelope {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("frame within timeout")
            .expect("link open")
    }

    pub fn try_next_frame(&mut self) -> Option<EventEnvelope> {
        self.sent.try_recv().ok()
    }

    pub async fn push(&self, envelope: EventEnvelope) {
        self.inbound
            .send(TransportSignal::Event(envelope))
            .await
            .expect("client pump alive");
    }

    pub async fn close(self, reason: &str) {
        let _ = self
            .inbound
            .send(TransportSignal::Closed {
                reason: reason.to_string(),
            })
            .await;
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    opens: AtomicUsize,
    failures_remaining: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
    link_capacity: Option<usize>,
    remotes: Mutex<VecDeque<FakeRemote>>,
    remote_ready: Notify,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_open_delay(delay: Duration) -> Arc<Self> {
        let connector = Self::default();
        *connector.open_delay.lock() = Some(delay);
        Arc::new(connector)
    }

    /// Links whose outbound side holds only `capacity` unread frames.
    pub fn with_link_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            link_capacity: Some(capacity),
            ..Self::default()
        })
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub async fn next_remote(&self) -> FakeRemote {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.remote_ready.notified();
                if let Some(remote) = self.remotes.lock().pop_front() {
                    return remote;
                }
                notified.await;
            }
        })
        .await
        .expect("remote within timeout")
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn open(&self, credential: &Credential) -> Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChatError::Transport("connection refused".into()));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.link_capacity.unwrap_or(256));
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        self.remotes.lock().push_back(FakeRemote {
            token: credential.token.clone(),
            sent: outbound_rx,
            inbound: inbound_tx,
        });
        self.remote_ready.notify_waiters();
        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            abort: None,
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeHistory {
    responses: Mutex<HashMap<ConversationId, Result<Vec<MessagePayload>>>>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl FakeHistory {
    pub fn with(conversation_id: i64, messages: Vec<MessagePayload>) -> Self {
        let history = Self::default();
        history
            .responses
            .lock()
            .insert(ConversationId(conversation_id), Ok(messages));
        history
    }

    pub fn failing(conversation_id: i64, err: ChatError) -> Self {
        let history = Self::default();
        history
            .responses
            .lock()
            .insert(ConversationId(conversation_id), Err(err));
        history
    }

    /// Each load blocks until the returned gate is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistorySource for FakeHistory {
    async fn load(
        &self,
        conversation_id: ConversationId,
        _credential: &Credential,
    ) -> Result<Vec<MessagePayload>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.responses
            .lock()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
