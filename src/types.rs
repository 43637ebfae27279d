//! Basic type definitions for the chat core
//!
//! Provides newtype wrappers for type safety:
//! - `UserId`: identifies an account, issued by the token validator
//! - `ConversationId`: identifies a conversation in the store
//! - `MessageId`: identifies a stored chat message
//! - `ConnectionId`: identifies one live WebSocket inside the hub
//!
//! and the `ConversationKind` shared by the pairing engine and the store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| AppError::InvalidInput(format!("invalid {}: '{}'", $label, s)))
            }
        }
    };
}

uuid_newtype!(
    /// Account identifier
    UserId,
    "user id"
);

uuid_newtype!(
    /// Conversation identifier
    ConversationId,
    "conversation id"
);

uuid_newtype!(
    /// Chat message identifier
    MessageId,
    "message id"
);

uuid_newtype!(
    /// Hub-local identifier of one accepted socket
    ///
    /// A user may hold several connections (several tabs, several
    /// conversations), so the registry is keyed by this rather than `UserId`.
    ConnectionId,
    "connection id"
);

/// Kind of a conversation
///
/// `Ephemeral` conversations come out of matchmaking and are soft-deleted once
/// every participant has gone inactive. `Saved` conversations were promoted by a
/// participant and block future random pairing between the same two users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Group,
    Private,
    Saved,
    Ephemeral,
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversationKind::Group => "group",
            ConversationKind::Private => "private",
            ConversationKind::Saved => "saved",
            ConversationKind::Ephemeral => "ephemeral",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_unique() {
        let id1 = UserId::new();
        let id2 = UserId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_parse_roundtrip_display() {
        let id = ConversationId::new();
        let parsed: ConversationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_id_parse_rejects_garbage() {
        let err = "not-a-uuid".parse::<UserId>().unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = MessageId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_conversation_kind_wire_name() {
        let json = serde_json::to_string(&ConversationKind::Ephemeral).unwrap();
        assert_eq!(json, "\"ephemeral\"");
        assert_eq!(ConversationKind::Saved.to_string(), "saved");
    }
}
