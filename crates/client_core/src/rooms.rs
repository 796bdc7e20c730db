use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{events, ConversationPayload, EventEnvelope},
};
use tracing::{debug, info, warn};

use crate::{
    error::{ChatError, Result},
    transport::{ConnectionManager, ConnectionState, EmitOutcome, HandlerId},
};

/// A conversation and the users taking part in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRoom {
    conversation_id: ConversationId,
    membership: BTreeSet<UserId>,
}

impl ConversationRoom {
    pub fn new(
        conversation_id: ConversationId,
        participants: impl IntoIterator<Item = UserId>,
    ) -> Result<Self> {
        let membership: BTreeSet<UserId> = participants.into_iter().collect();
        if membership.len() < 2 {
            return Err(ChatError::Validation(format!(
                "conversation {conversation_id} needs at least two distinct participants"
            )));
        }
        Ok(Self {
            conversation_id,
            membership,
        })
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn membership(&self) -> &BTreeSet<UserId> {
        &self.membership
    }

    pub fn includes(&self, user_id: UserId) -> bool {
        self.membership.contains(&user_id)
    }
}

#[derive(Default)]
struct RoomSet {
    joined: HashSet<ConversationId>,
    active: Option<ConversationId>,
}

/// Joins and leaves conversation channels over the shared connection and
/// tracks which one is on screen. Joined rooms are re-joined on every new
/// link before frames queued while offline go out.
pub struct RoomBinder {
    connection: Arc<ConnectionManager>,
    rooms: Arc<Mutex<RoomSet>>,
    rejoin_handler: HandlerId,
}

impl RoomBinder {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        let rooms = Arc::new(Mutex::new(RoomSet::default()));
        let opener_rooms = Arc::clone(&rooms);
        let rejoin_handler = connection.on_link_open(Arc::new(move || -> Vec<EventEnvelope> {
            let joined: Vec<ConversationId> =
                opener_rooms.lock().joined.iter().copied().collect();
            joined
                .into_iter()
                .filter_map(|conversation_id| {
                    match EventEnvelope::encode(
                        events::JOIN_CONVERSATION,
                        &ConversationPayload { conversation_id },
                    ) {
                        Ok(frame) => {
                            info!(conversation_id = conversation_id.0, "rooms: re-joining on new link");
                            Some(frame)
                        }
                        Err(err) => {
                            warn!(conversation_id = conversation_id.0, "rooms: failed to encode join: {err}");
                            None
                        }
                    }
                })
                .collect()
        }));

        Self {
            connection,
            rooms,
            rejoin_handler,
        }
    }

    /// Leaves the previously active room, then joins `conversation_id`.
    pub fn join(&self, conversation_id: ConversationId) -> Result<()> {
        let state = self.connection.state();
        if state != ConnectionState::Connected {
            return Err(ChatError::Transport(format!(
                "cannot join conversation {conversation_id} while {state:?}"
            )));
        }

        let previous = self
            .rooms
            .lock()
            .active
            .filter(|active| *active != conversation_id);
        if let Some(previous) = previous {
            self.leave(previous);
        }

        let outcome = self
            .connection
            .emit_payload(events::JOIN_CONVERSATION, &ConversationPayload { conversation_id });
        if outcome == EmitOutcome::Dropped {
            return Err(ChatError::Transport(format!(
                "join request for conversation {conversation_id} was dropped"
            )));
        }

        let mut rooms = self.rooms.lock();
        rooms.joined.insert(conversation_id);
        rooms.active = Some(conversation_id);
        info!(conversation_id = conversation_id.0, ?outcome, "rooms: joined conversation");
        Ok(())
    }

    /// Safe to call for rooms that were never joined.
    pub fn leave(&self, conversation_id: ConversationId) {
        let was_joined = {
            let mut rooms = self.rooms.lock();
            if rooms.active == Some(conversation_id) {
                rooms.active = None;
            }
            rooms.joined.remove(&conversation_id)
        };
        if !was_joined {
            debug!(conversation_id = conversation_id.0, "rooms: leaving a room that was not joined");
        }

        let outcome = self
            .connection
            .emit_payload(events::LEAVE_CONVERSATION, &ConversationPayload { conversation_id });
        if outcome == EmitOutcome::Dropped {
            warn!(conversation_id = conversation_id.0, "rooms: leave request dropped");
        } else {
            info!(conversation_id = conversation_id.0, ?outcome, "rooms: left conversation");
        }
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.rooms.lock().active
    }

    pub fn is_active(&self, conversation_id: ConversationId) -> bool {
        self.active() == Some(conversation_id)
    }

    pub fn is_joined(&self, conversation_id: ConversationId) -> bool {
        self.rooms.lock().joined.contains(&conversation_id)
    }

    /// Forgets every room without emitting; the connection is going away.
    pub fn reset(&self) {
        let mut rooms = self.rooms.lock();
        rooms.joined.clear();
        rooms.active = None;
    }
}

impl Drop for RoomBinder {
    fn drop(&mut self) {
        self.connection.off_event(self.rejoin_handler);
    }
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
