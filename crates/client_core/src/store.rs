use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientMessageId, ConversationId, MessageId, UserId},
    protocol::MessagePayload,
};
use tracing::{debug, warn};

use crate::error::{ChatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Local(ClientMessageId),
    Server(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageKey,
    /// Correlation id of a message sent from this client, kept after
    /// confirmation so late echoes still resolve to the same entry.
    pub correlation_id: Option<ClientMessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

impl Message {
    pub fn server_id(&self) -> Option<MessageId> {
        match self.id {
            MessageKey::Server(id) => Some(id),
            MessageKey::Local(_) => None,
        }
    }

    pub fn local_id(&self) -> Option<ClientMessageId> {
        match self.id {
            MessageKey::Local(id) => Some(id),
            MessageKey::Server(_) => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DeliveryState::Confirmed
    }

    fn from_server(payload: MessagePayload) -> Self {
        Self {
            id: MessageKey::Server(payload.id),
            correlation_id: payload.client_message_id,
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            content: payload.content,
            attachment_url: payload.image_url,
            created_at: payload.created_at,
            state: DeliveryState::Confirmed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The message belongs to another conversation.
    Ignored,
    /// Already present under its server id.
    Duplicate,
    /// A local entry was confirmed in place.
    Confirmed { local_id: ClientMessageId },
    Inserted,
}

impl ReconcileOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Inserted)
    }
}

fn normalized(content: Option<String>) -> Option<String> {
    content.filter(|text| !text.trim().is_empty())
}

/// Ordered messages of one conversation as seen by one user.
///
/// Entries stay sorted by `created_at`; equal timestamps keep insertion
/// order. A server id appears at most once.
#[derive(Debug)]
pub struct MessageStore {
    conversation_id: ConversationId,
    current_user: UserId,
    entries: Vec<Message>,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId, current_user: UserId) -> Self {
        Self {
            conversation_id,
            current_user,
            entries: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn current_user(&self) -> UserId {
        self.current_user
    }

    pub fn list(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, local_id: ClientMessageId) -> Option<&Message> {
        self.entries
            .iter()
            .find(|message| message.correlation_id == Some(local_id))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Replaces everything with `history`.
    pub fn seed(&mut self, history: Vec<MessagePayload>) {
        let total = history.len();
        let mut seeded: Vec<Message> = Vec::with_capacity(total);
        for payload in history {
            if payload.conversation_id != self.conversation_id {
                warn!(
                    conversation_id = self.conversation_id.0,
                    foreign = payload.conversation_id.0,
                    "store: history entry from another conversation skipped"
                );
                continue;
            }
            if seeded.iter().any(|m| m.server_id() == Some(payload.id)) {
                continue;
            }
            seeded.push(Message::from_server(payload));
        }
        seeded.sort_by_key(|message| message.created_at);
        debug!(
            conversation_id = self.conversation_id.0,
            received = total,
            kept = seeded.len(),
            "store: seeded"
        );
        self.entries = seeded;
    }

    /// Seeds, then puts back local messages that the history does not know
    /// about yet.
    pub fn reseed(&mut self, history: Vec<MessagePayload>) {
        let unconfirmed: Vec<Message> = self
            .entries
            .iter()
            .filter(|message| !message.is_confirmed())
            .cloned()
            .collect();
        self.seed(history);
        for message in unconfirmed {
            let known = message.correlation_id.is_some()
                && self
                    .entries
                    .iter()
                    .any(|existing| existing.correlation_id == message.correlation_id);
            if !known {
                self.insert_sorted(message);
            }
        }
    }

    /// Adds an optimistic message from the current user at the tail.
    pub fn append_local(
        &mut self,
        content: Option<String>,
        attachment_url: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ClientMessageId> {
        let content = normalized(content);
        let attachment_url = normalized(attachment_url);
        if content.is_none() && attachment_url.is_none() {
            return Err(ChatError::Validation(
                "a message needs content or an attachment".into(),
            ));
        }

        let local_id = ClientMessageId::generate();
        let created_at = self
            .entries
            .last()
            .map_or(now, |tail| tail.created_at.max(now));
        self.entries.push(Message {
            id: MessageKey::Local(local_id),
            correlation_id: Some(local_id),
            conversation_id: self.conversation_id,
            sender_id: self.current_user,
            content,
            attachment_url,
            created_at,
            state: DeliveryState::Pending,
        });
        debug!(
            conversation_id = self.conversation_id.0,
            %local_id,
            "store: local message appended"
        );
        Ok(local_id)
    }

    pub fn reconcile(&mut self, payload: MessagePayload) -> ReconcileOutcome {
        if payload.conversation_id != self.conversation_id {
            return ReconcileOutcome::Ignored;
        }
        if self
            .entries
            .iter()
            .any(|message| message.server_id() == Some(payload.id))
        {
            debug!(
                conversation_id = self.conversation_id.0,
                message_id = payload.id.0,
                "store: duplicate delivery ignored"
            );
            return ReconcileOutcome::Duplicate;
        }

        let matched = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, message)| !message.is_confirmed())
            .filter_map(|(index, message)| message.local_id().map(|id| (index, id, message)))
            .find(|(_, local_id, message)| match payload.client_message_id {
                Some(correlation) => correlation == *local_id,
                None => {
                    payload.sender_id == self.current_user
                        && message.sender_id == payload.sender_id
                        && message.content == payload.content
                        && message.attachment_url == payload.image_url
                }
            })
            .map(|(index, local_id, _)| (index, local_id));

        let Some((position, local_id)) = matched else {
            let message_id = payload.id;
            self.insert_sorted(Message::from_server(payload));
            debug!(
                conversation_id = self.conversation_id.0,
                message_id = message_id.0,
                "store: server message inserted"
            );
            return ReconcileOutcome::Inserted;
        };

        let mut message = self.entries.remove(position);
        message.id = MessageKey::Server(payload.id);
        message.correlation_id = Some(local_id);
        message.created_at = payload.created_at;
        message.content = payload.content;
        message.attachment_url = payload.image_url;
        message.state = DeliveryState::Confirmed;
        self.insert_sorted(message);
        debug!(
            conversation_id = self.conversation_id.0,
            message_id = payload.id.0,
            %local_id,
            "store: local message confirmed"
        );
        ReconcileOutcome::Confirmed { local_id }
    }

    /// Returns false when the message is unknown or already confirmed.
    pub fn mark_failed(&mut self, local_id: ClientMessageId) -> bool {
        match self.unconfirmed_mut(local_id) {
            Some(message) => {
                message.state = DeliveryState::Failed;
                true
            }
            None => false,
        }
    }

    /// Moves a failed message back to pending and returns a copy to resend.
    pub fn requeue(&mut self, local_id: ClientMessageId) -> Option<Message> {
        let message = self.unconfirmed_mut(local_id)?;
        if message.state != DeliveryState::Failed {
            return None;
        }
        message.state = DeliveryState::Pending;
        Some(message.clone())
    }

    fn unconfirmed_mut(&mut self, local_id: ClientMessageId) -> Option<&mut Message> {
        self.entries
            .iter_mut()
            .find(|message| message.id == MessageKey::Local(local_id))
    }

    fn insert_sorted(&mut self, message: Message) {
        let index = self
            .entries
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.entries.insert(index, message);
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
