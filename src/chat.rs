//! Chat messages and the actions that fan them out
//!
//! `MessageService` validates an action against the stores, persists the
//! result, and only then pushes a `BroadcastEvent` into the hub.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::AppError;
use crate::event::{BroadcastEvent, EventType};
use crate::hub::HubHandle;
use crate::store::{ConversationStore, MessageEdit, MessageStore};
use crate::types::{ConversationId, MessageId, UserId};

/// Default page size of `MessageService::list`
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page size accepted by `MessageService::list`
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Sticker,
    Gif,
    Voice,
    Video,
    Image,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Edited,
    Deleted,
}

/// Fields supplied by the author when sending
#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            media_url: None,
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub author: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub status: MessageStatus,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub read_by: Vec<UserId>,
    pub read_at: Option<DateTime<Utc>>,
    pub liked_by: Vec<UserId>,
    pub likes_count: usize,
    pub liked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(conversation_id: ConversationId, author: UserId, new: NewMessage) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            author,
            kind: new.kind,
            content: new.content,
            media_url: new.media_url,
            reply_to: new.reply_to,
            status: MessageStatus::Sent,
            is_edited: false,
            edited_at: None,
            read_by: Vec::new(),
            read_at: None,
            liked_by: Vec::new(),
            likes_count: 0,
            liked_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn mark_delivered(&mut self) {
        self.status = MessageStatus::Delivered;
    }

    /// Record a read; repeated reads by the same user change nothing
    pub fn mark_read(&mut self, user_id: UserId) {
        if self.is_read_by(user_id) {
            return;
        }
        self.read_by.push(user_id);
        if self.read_at.is_none() {
            self.read_at = Some(Utc::now());
        }
        self.status = MessageStatus::Read;
    }

    pub fn mark_edited(&mut self, content: String) {
        self.content = content;
        self.status = MessageStatus::Edited;
        self.is_edited = true;
        self.edited_at = Some(Utc::now());
    }

    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.contains(&user_id)
    }

    pub fn is_liked_by(&self, user_id: UserId) -> bool {
        self.liked_by.contains(&user_id)
    }

    /// Conflict if the user already liked this message
    pub fn like(&mut self, user_id: UserId) -> Result<(), AppError> {
        if self.is_liked_by(user_id) {
            return Err(AppError::Conflict("message already liked by this user".into()));
        }
        self.liked_by.push(user_id);
        self.likes_count = self.liked_by.len();
        self.liked_at = Some(Utc::now());
        Ok(())
    }

    /// Conflict if the user has not liked this message
    pub fn unlike(&mut self, user_id: UserId) -> Result<(), AppError> {
        let Some(pos) = self.liked_by.iter().position(|id| *id == user_id) else {
            return Err(AppError::Conflict("message not liked by this user".into()));
        };
        self.liked_by.remove(pos);
        self.likes_count = self.liked_by.len();
        self.liked_at = if self.liked_by.is_empty() {
            None
        } else {
            Some(Utc::now())
        };
        Ok(())
    }

    pub fn likes_info(&self, viewer: UserId) -> LikesInfo {
        LikesInfo {
            message_id: self.id,
            likes_count: self.likes_count,
            liked_by: self.liked_by.clone(),
            liked_at: self.liked_at,
            is_liked_by_user: self.is_liked_by(viewer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LikesInfo {
    pub message_id: MessageId,
    pub likes_count: usize,
    pub liked_by: Vec<UserId>,
    pub liked_at: Option<DateTime<Utc>>,
    pub is_liked_by_user: bool,
}

/// Message actions for the caller layer
#[derive(Clone)]
pub struct MessageService {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    hub: HubHandle,
}

impl MessageService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        hub: HubHandle,
    ) -> Self {
        Self {
            conversations,
            messages,
            hub,
        }
    }

    pub async fn send(
        &self,
        conversation_id: ConversationId,
        author: UserId,
        new: NewMessage,
    ) -> Result<ChatMessage, AppError> {
        self.require_participant(conversation_id, author).await?;
        if new.content.trim().is_empty() {
            return Err(AppError::InvalidInput("message content is empty".into()));
        }

        let mut message = ChatMessage::new(conversation_id, author, new);
        message.mark_delivered();
        self.messages.insert_message(&message).await?;

        debug!("User {} sent message {} to {}", author, message.id, conversation_id);
        self.publish(EventType::NewMessage, conversation_id, serde_json::to_value(&message)?)
            .await?;
        Ok(message)
    }

    /// Author only
    pub async fn edit(
        &self,
        message_id: MessageId,
        user_id: UserId,
        content: String,
    ) -> Result<ChatMessage, AppError> {
        if content.trim().is_empty() {
            return Err(AppError::InvalidInput("message content is empty".into()));
        }
        let edit: MessageEdit = Box::new(move |message: &mut ChatMessage| {
            if message.author != user_id {
                return Err(AppError::Unauthorized(
                    "you can only edit your own messages".into(),
                ));
            }
            message.mark_edited(content);
            Ok(())
        });
        let message = self.messages.modify_message(message_id, edit).await?;

        self.publish(
            EventType::MessageEdited,
            message.conversation_id,
            serde_json::to_value(&message)?,
        )
        .await?;
        Ok(message)
    }

    /// Author only
    pub async fn delete(&self, message_id: MessageId, user_id: UserId) -> Result<(), AppError> {
        let message = self.messages.message(message_id).await?;
        if message.author != user_id {
            return Err(AppError::Unauthorized("you can only delete your own messages".into()));
        }

        self.messages.delete_message(message_id).await?;
        info!("User {} deleted message {}", user_id, message_id);

        self.publish(
            EventType::MessageDeleted,
            message.conversation_id,
            json!({ "message_id": message_id }),
        )
        .await
    }

    pub async fn like(&self, message_id: MessageId, user_id: UserId) -> Result<LikesInfo, AppError> {
        self.member_message(message_id, user_id).await?;
        let edit: MessageEdit = Box::new(move |message: &mut ChatMessage| message.like(user_id));
        let message = self.messages.modify_message(message_id, edit).await?;

        let info = message.likes_info(user_id);
        self.publish(EventType::MessageLiked, message.conversation_id, likes_payload(&info))
            .await?;
        Ok(info)
    }

    pub async fn unlike(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<LikesInfo, AppError> {
        self.member_message(message_id, user_id).await?;
        let edit: MessageEdit =
            Box::new(move |message: &mut ChatMessage| message.unlike(user_id));
        let message = self.messages.modify_message(message_id, edit).await?;

        let info = message.likes_info(user_id);
        self.publish(EventType::MessageUnliked, message.conversation_id, likes_payload(&info))
            .await?;
        Ok(info)
    }

    pub async fn mark_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<ChatMessage, AppError> {
        self.member_message(message_id, user_id).await?;
        let edit: MessageEdit = Box::new(move |message: &mut ChatMessage| {
            message.mark_read(user_id);
            Ok(())
        });
        let message = self.messages.modify_message(message_id, edit).await?;

        self.publish(
            EventType::StatusUpdate,
            message.conversation_id,
            json!({
                "message_id": message.id,
                "status": message.status,
                "read_by": message.read_by,
                "read_at": message.read_at,
            }),
        )
        .await?;
        Ok(message)
    }

    pub async fn likes(&self, message_id: MessageId, user_id: UserId) -> Result<LikesInfo, AppError> {
        let message = self.member_message(message_id, user_id).await?;
        Ok(message.likes_info(user_id))
    }

    /// Newest first; `page` starts at 1, `limit` defaults to `DEFAULT_PAGE_SIZE`
    pub async fn list(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        page: usize,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, AppError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if page == 0 {
            return Err(AppError::InvalidInput("page starts at 1".into()));
        }
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(AppError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        self.require_participant(conversation_id, user_id).await?;
        Ok(self
            .messages
            .messages(conversation_id, (page - 1) * limit, limit)
            .await?)
    }

    async fn require_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), AppError> {
        if self
            .conversations
            .is_participant(conversation_id, user_id)
            .await?
        {
            Ok(())
        } else {
            Err(AppError::Unauthorized("not a participant of this conversation".into()))
        }
    }

    async fn member_message(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<ChatMessage, AppError> {
        let message = self.messages.message(message_id).await?;
        self.require_participant(message.conversation_id, user_id).await?;
        Ok(message)
    }

    async fn publish(
        &self,
        event_type: EventType,
        conversation_id: ConversationId,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        self.hub
            .broadcast(BroadcastEvent::new(event_type, conversation_id, payload))
            .await
    }
}

fn likes_payload(info: &LikesInfo) -> serde_json::Value {
    json!({
        "message_id": info.message_id,
        "likes_count": info.likes_count,
        "liked_by": info.liked_by,
        "liked_at": info.liked_at,
    })
}
