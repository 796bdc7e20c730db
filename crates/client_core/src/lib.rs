//! Client-side session manager for realtime marketplace conversations.
//!
//! A [`SessionManager`] owns one authenticated realtime connection, binds
//! conversation rooms over it, seeds each conversation from the backend
//! history and reconciles optimistic sends with server confirmations.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod history;
pub mod rooms;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::BackendClient;
pub use config::{load_settings, ClientSettings, ReconnectPolicy};
pub use credentials::{Credential, CredentialProvider, FileKeyValueStore, KeyValueStore};
pub use error::{ChatError, Result};
pub use history::HistorySource;
pub use rooms::{ConversationRoom, RoomBinder};
pub use session::{ConversationSession, SessionEvent, SessionManager};
pub use store::{DeliveryState, Message, MessageStore, ReconcileOutcome};
pub use transport::{ConnectionManager, ConnectionState, EmitOutcome, WebSocketConnector};
