//! Store collaborators
//!
//! The core never touches persistence directly. These traits are the seams
//! through which it reaches the conversation/participant store, the message
//! store and the user directory. `InMemoryStore` implements all three and backs
//! the binary and the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::chat::ChatMessage;
use crate::error::{AppError, StoreError};
use crate::types::{ConversationId, ConversationKind, MessageId, UserId};

/// A named channel with participants
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    pub description: String,
    pub kind: ConversationKind,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Membership of a user in a conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Conversation and participant persistence
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        kind: ConversationKind,
        name: &str,
        creator: UserId,
    ) -> Result<ConversationId, StoreError>;

    /// Fails with `Conflict` if the user already participates
    async fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), StoreError>;

    async fn conversation(&self, conversation_id: ConversationId)
        -> Result<Conversation, StoreError>;

    async fn participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Participant>, StoreError>;

    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, StoreError>;

    /// Whether a conversation of kind `Saved` contains both users
    async fn has_saved_conversation_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<bool, StoreError>;

    /// Flip the conversation to `Saved` under `name`
    ///
    /// Conflict if it is already saved, or if another saved conversation
    /// already holds two of its participants. The check and the write are
    /// one step.
    async fn save_conversation(
        &self,
        conversation_id: ConversationId,
        name: &str,
    ) -> Result<Conversation, StoreError>;

    async fn set_participant_active(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        active: bool,
    ) -> Result<(), StoreError>;

    async fn count_active_participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, StoreError>;

    /// Removes the conversation with its participants and messages
    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), StoreError>;
}

/// Change applied by `MessageStore::modify_message`
pub type MessageEdit = Box<dyn FnOnce(&mut ChatMessage) -> Result<(), AppError> + Send>;

/// Chat message persistence
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    async fn message(&self, message_id: MessageId) -> Result<ChatMessage, StoreError>;

    /// Apply `edit` to the stored message and persist it in one step
    ///
    /// No other write to the message can land between the read and the
    /// write. An error from `edit` leaves the stored message untouched and
    /// is returned as is.
    async fn modify_message(
        &self,
        message_id: MessageId,
        edit: MessageEdit,
    ) -> Result<ChatMessage, AppError>;

    async fn delete_message(&self, message_id: MessageId) -> Result<(), StoreError>;

    /// Newest first
    async fn messages(
        &self,
        conversation_id: ConversationId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}

/// User lookup
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user_id: UserId) -> Result<String, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, String>,
    conversations: HashMap<ConversationId, Conversation>,
    participants: HashMap<ConversationId, Vec<Participant>>,
    messages: HashMap<MessageId, ChatMessage>,
    /// Insertion order of messages per conversation
    timelines: HashMap<ConversationId, Vec<MessageId>>,
}

impl Tables {
    fn participant_mut(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<&mut Participant, StoreError> {
        self.participants
            .get_mut(&conversation_id)
            .and_then(|ps| ps.iter_mut().find(|p| p.user_id == user_id))
            .ok_or_else(|| StoreError::NotFound("participant".into()))
    }

    fn has_participant(&self, conversation_id: ConversationId, user_id: UserId) -> bool {
        self.participants
            .get(&conversation_id)
            .is_some_and(|ps| ps.iter().any(|p| p.user_id == user_id))
    }
}

/// Single-process store behind one `RwLock`
///
/// Each trait method holds the lock for its whole body, so every write is
/// atomic with respect to other calls.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user so lookups succeed
    pub async fn add_user(&self, user_id: UserId, display_name: impl Into<String>) {
        self.tables
            .write()
            .await
            .users
            .insert(user_id, display_name.into());
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(
        &self,
        kind: ConversationKind,
        name: &str,
        creator: UserId,
    ) -> Result<ConversationId, StoreError> {
        let id = ConversationId::new();
        let conversation = Conversation {
            id,
            name: name.to_string(),
            description: String::new(),
            kind,
            created_by: creator,
            created_at: Utc::now(),
        };
        let mut tables = self.tables.write().await;
        tables.conversations.insert(id, conversation);
        tables.participants.insert(id, Vec::new());
        Ok(id)
    }

    async fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&conversation_id) {
            return Err(StoreError::NotFound("conversation".into()));
        }
        if tables.has_participant(conversation_id, user_id) {
            return Err(StoreError::Conflict("participant".into()));
        }
        tables
            .participants
            .entry(conversation_id)
            .or_default()
            .push(Participant {
                conversation_id,
                user_id,
                joined_at: Utc::now(),
                is_active: true,
            });
        Ok(())
    }

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, StoreError> {
        self.tables
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("conversation".into()))
    }

    async fn participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Participant>, StoreError> {
        self.tables
            .read()
            .await
            .participants
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("conversation".into()))
    }

    async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .has_participant(conversation_id, user_id))
    }

    async fn has_saved_conversation_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<bool, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .conversations
            .values()
            .filter(|c| c.kind == ConversationKind::Saved)
            .any(|c| tables.has_participant(c.id, a) && tables.has_participant(c.id, b)))
    }

    async fn save_conversation(
        &self,
        conversation_id: ConversationId,
        name: &str,
    ) -> Result<Conversation, StoreError> {
        let mut tables = self.tables.write().await;
        let kind = tables
            .conversations
            .get(&conversation_id)
            .map(|c| c.kind)
            .ok_or_else(|| StoreError::NotFound("conversation".into()))?;
        if kind == ConversationKind::Saved {
            return Err(StoreError::Conflict("saved conversation".into()));
        }

        let members: Vec<UserId> = tables
            .participants
            .get(&conversation_id)
            .map(|ps| ps.iter().map(|p| p.user_id).collect())
            .unwrap_or_default();
        let duplicate = tables
            .conversations
            .values()
            .filter(|c| c.kind == ConversationKind::Saved)
            .any(|c| members.iter().filter(|u| tables.has_participant(c.id, **u)).count() >= 2);
        if duplicate {
            return Err(StoreError::Conflict("saved conversation".into()));
        }

        let conversation = tables
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::NotFound("conversation".into()))?;
        conversation.kind = ConversationKind::Saved;
        conversation.name = name.to_string();
        Ok(conversation.clone())
    }

    async fn set_participant_active(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        active: bool,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.participant_mut(conversation_id, user_id)?.is_active = active;
        Ok(())
    }

    async fn count_active_participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<usize, StoreError> {
        self.tables
            .read()
            .await
            .participants
            .get(&conversation_id)
            .map(|ps| ps.iter().filter(|p| p.is_active).count())
            .ok_or_else(|| StoreError::NotFound("conversation".into()))
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.conversations.remove(&conversation_id).is_none() {
            return Err(StoreError::NotFound("conversation".into()));
        }
        tables.participants.remove(&conversation_id);
        for message_id in tables.timelines.remove(&conversation_id).unwrap_or_default() {
            tables.messages.remove(&message_id);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::NotFound("conversation".into()));
        }
        if tables.messages.contains_key(&message.id) {
            return Err(StoreError::Conflict("message".into()));
        }
        tables
            .timelines
            .entry(message.conversation_id)
            .or_default()
            .push(message.id);
        tables.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn message(&self, message_id: MessageId) -> Result<ChatMessage, StoreError> {
        self.tables
            .read()
            .await
            .messages
            .get(&message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("message".into()))
    }

    async fn modify_message(
        &self,
        message_id: MessageId,
        edit: MessageEdit,
    ) -> Result<ChatMessage, AppError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound("message".into()))?;

        let mut updated = stored.clone();
        edit(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let message = tables
            .messages
            .remove(&message_id)
            .ok_or_else(|| StoreError::NotFound("message".into()))?;
        if let Some(timeline) = tables.timelines.get_mut(&message.conversation_id) {
            timeline.retain(|id| *id != message_id);
        }
        Ok(())
    }

    async fn messages(
        &self,
        conversation_id: ConversationId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let tables = self.tables.read().await;
        let Some(timeline) = tables.timelines.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        Ok(timeline
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|id| tables.messages.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn display_name(&self, user_id: UserId) -> Result<String, StoreError> {
        self.tables
            .read()
            .await
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("user".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{MessageKind, NewMessage};

    async fn conversation_with(
        store: &InMemoryStore,
        kind: ConversationKind,
        users: &[UserId],
    ) -> ConversationId {
        let id = store.create_conversation(kind, "test", users[0]).await.unwrap();
        for u in users {
            store.add_participant(id, *u).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn test_saved_conversation_lookup_is_symmetric_and_kind_aware() {
        let store = InMemoryStore::new();
        let (x, y, z) = (UserId::new(), UserId::new(), UserId::new());

        conversation_with(&store, ConversationKind::Ephemeral, &[x, y]).await;
        assert!(!store.has_saved_conversation_between(x, y).await.unwrap());

        let id = conversation_with(&store, ConversationKind::Private, &[x, y]).await;
        store.save_conversation(id, "saved").await.unwrap();

        assert!(store.has_saved_conversation_between(x, y).await.unwrap());
        assert!(store.has_saved_conversation_between(y, x).await.unwrap());
        assert!(!store.has_saved_conversation_between(x, z).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_conversation_refuses_second_saved_pair() {
        let store = InMemoryStore::new();
        let (x, y, z) = (UserId::new(), UserId::new(), UserId::new());
        let first = conversation_with(&store, ConversationKind::Ephemeral, &[x, y]).await;
        let second = conversation_with(&store, ConversationKind::Ephemeral, &[y, x]).await;
        let other = conversation_with(&store, ConversationKind::Ephemeral, &[x, z]).await;

        let saved = store.save_conversation(first, "Saved Chat - a").await.unwrap();
        assert_eq!(saved.kind, ConversationKind::Saved);
        assert_eq!(saved.name, "Saved Chat - a");

        let err = store.save_conversation(first, "again").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let err = store.save_conversation(second, "dup").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(
            store.conversation(second).await.unwrap().kind,
            ConversationKind::Ephemeral
        );

        store.save_conversation(other, "x and z").await.unwrap();
        let err = store
            .save_conversation(ConversationId::new(), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_modify_message_applies_or_leaves_untouched() {
        let store = InMemoryStore::new();
        let (x, y) = (UserId::new(), UserId::new());
        let id = conversation_with(&store, ConversationKind::Group, &[x, y]).await;
        let message = ChatMessage::new(id, x, NewMessage::text("hi"));
        store.insert_message(&message).await.unwrap();

        let liked = store
            .modify_message(message.id, Box::new(move |m: &mut ChatMessage| m.like(y)))
            .await
            .unwrap();
        assert_eq!(liked.likes_count, 1);

        let err = store
            .modify_message(
                message.id,
                Box::new(move |m: &mut ChatMessage| {
                    m.content = "rewritten".into();
                    m.like(y)
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let stored = store.message(message.id).await.unwrap();
        assert_eq!(stored.content, "hi");
        assert_eq!(stored.likes_count, 1);

        let err = store
            .modify_message(
                MessageId::new(),
                Box::new(|_: &mut ChatMessage| -> Result<(), AppError> { Ok(()) }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_add_participant_twice_conflicts() {
        let store = InMemoryStore::new();
        let x = UserId::new();
        let id = conversation_with(&store, ConversationKind::Group, &[x]).await;

        let err = store.add_participant(id, x).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store
            .add_participant(ConversationId::new(), x)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_active_participant_count() {
        let store = InMemoryStore::new();
        let (x, y) = (UserId::new(), UserId::new());
        let id = conversation_with(&store, ConversationKind::Ephemeral, &[x, y]).await;

        assert_eq!(store.count_active_participants(id).await.unwrap(), 2);
        store.set_participant_active(id, x, false).await.unwrap();
        assert_eq!(store.count_active_participants(id).await.unwrap(), 1);

        let err = store
            .set_participant_active(id, UserId::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let store = InMemoryStore::new();
        let x = UserId::new();
        let id = conversation_with(&store, ConversationKind::Ephemeral, &[x]).await;
        let message = ChatMessage::new(id, x, NewMessage::text("hi"));
        store.insert_message(&message).await.unwrap();

        store.delete_conversation(id).await.unwrap();

        assert!(store.conversation(id).await.is_err());
        assert!(!store.is_participant(id, x).await.unwrap());
        assert!(matches!(
            store.message(message.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.delete_conversation(id).await.is_err());
    }

    #[tokio::test]
    async fn test_messages_newest_first_with_paging() {
        let store = InMemoryStore::new();
        let x = UserId::new();
        let id = conversation_with(&store, ConversationKind::Group, &[x]).await;

        let mut ids = Vec::new();
        for n in 0..5 {
            let message = ChatMessage::new(id, x, NewMessage::text(format!("m{}", n)));
            ids.push(message.id);
            store.insert_message(&message).await.unwrap();
        }

        let page = store.messages(id, 1, 2).await.unwrap();
        let got: Vec<_> = page.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[3], ids[2]]);
        assert_eq!(page[0].kind, MessageKind::Text);

        store.delete_message(ids[4]).await.unwrap();
        assert_eq!(store.messages(id, 0, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_display_name_lookup() {
        let store = InMemoryStore::new();
        let x = UserId::new();
        store.add_user(x, "alice").await;

        assert_eq!(store.display_name(x).await.unwrap(), "alice");
        assert!(matches!(
            store.display_name(UserId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
