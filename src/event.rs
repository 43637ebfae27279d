//! Broadcast event protocol
//!
//! JSON envelope pushed to connected clients, plus the serializable error body
//! used when a connection or request is refused.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::types::ConversationId;

/// Kind of event fanned out by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NewMessage,
    MessageEdited,
    MessageDeleted,
    MessageLiked,
    MessageUnliked,
    StatusUpdate,
}

/// One event addressed to every connection bound to `conversation_id`
///
/// Produced by an application action, consumed once by the hub, never stored.
/// Serializes directly as the wire envelope:
/// `{"type": ..., "conversation_id": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub conversation_id: ConversationId,
    pub payload: Value,
}

impl BroadcastEvent {
    pub fn new(event_type: EventType, conversation_id: ConversationId, payload: Value) -> Self {
        Self {
            event_type,
            conversation_id,
            payload,
        }
    }

    /// Encode as a text frame body
    pub fn to_frame(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error codes for `ErrorBody`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    Unauthorized,
    InvalidInput,
    NoCandidateAvailable,
    Internal,
}

/// Error frame sent before a refused connection is closed
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    kind: &'static str,
    pub code: ErrorCode,
    pub message: String,
}

/// Convert AppError to an ErrorBody for client notification
impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Conflict(_) => ErrorCode::Conflict,
            AppError::Unauthorized(_) => ErrorCode::Unauthorized,
            AppError::InvalidInput(_) | AppError::Json(_) => ErrorCode::InvalidInput,
            AppError::NoCandidateAvailable => ErrorCode::NoCandidateAvailable,
            _ => ErrorCode::Internal,
        };
        // Internal details are not leaked to clients
        let message = match code {
            ErrorCode::Internal => "Internal error".to_string(),
            _ => err.to_string(),
        };
        ErrorBody {
            kind: "error",
            code,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let conversation_id = ConversationId::new();
        let event = BroadcastEvent::new(
            EventType::MessageDeleted,
            conversation_id,
            json!({ "message_id": "m1" }),
        );
        let value: Value = serde_json::from_str(&event.to_frame().unwrap()).unwrap();

        assert_eq!(value["type"], "message_deleted");
        assert_eq!(value["conversation_id"], conversation_id.to_string());
        assert_eq!(value["payload"]["message_id"], "m1");
    }

    #[test]
    fn test_status_update_wire_name() {
        let json = serde_json::to_string(&EventType::StatusUpdate).unwrap();
        assert_eq!(json, "\"status_update\"");
    }

    #[test]
    fn test_error_body_serialize() {
        let body = ErrorBody::from(&AppError::Unauthorized("not a participant".into()));
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"unauthorized\""));
    }

    #[test]
    fn test_error_body_hides_internal_errors() {
        let body = ErrorBody::from(&AppError::Store("connection refused to 10.0.0.3".into()));
        assert_eq!(body.code, ErrorCode::Internal);
        assert_eq!(body.message, "Internal error");
    }
}
