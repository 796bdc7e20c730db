use async_trait::async_trait;
use shared::{domain::ConversationId, protocol::MessagePayload};

use crate::{credentials::Credential, error::Result};

/// Where a conversation's past messages come from.
///
/// Failures are `Unauthorized`, `NotFound` or `Transport`; everything the
/// backend could not answer cleanly is a transport failure.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn load(
        &self,
        conversation_id: ConversationId,
        credential: &Credential,
    ) -> Result<Vec<MessagePayload>>;
}
