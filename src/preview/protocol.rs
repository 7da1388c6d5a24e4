//! Preview wire format
//!
//! Every frame is a JSON object with a `type` field. Field names are fixed
//! by the UI that consumes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mail::Message;
use crate::pipeline::PreviewResult;

pub const DEFAULT_FOLDER: &str = "INBOX";
pub const DEFAULT_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message")]
    InvalidMessage,

    #[error("invalid preview request")]
    InvalidPreviewRequest,

    #[error("unknown message type")]
    UnknownType(String),

    #[error("too many queued requests")]
    Backlog,
}

/// Body of a `preview` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub account_id: i64,
    #[serde(default)]
    pub folder: String,
    /// Zero or negative means the default
    #[serde(default)]
    pub limit: i64,
}

impl PreviewRequest {
    pub fn new(account_id: i64) -> Self {
        Self {
            account_id,
            folder: String::new(),
            limit: 0,
        }
    }

    /// Fill in the folder and limit defaults
    pub fn normalized(mut self) -> Self {
        if self.folder.trim().is_empty() {
            self.folder = DEFAULT_FOLDER.to_string();
        }
        if self.limit <= 0 {
            self.limit = DEFAULT_LIMIT as i64;
        }
        self
    }

    pub fn limit(&self) -> u32 {
        if self.limit <= 0 {
            DEFAULT_LIMIT
        } else {
            u32::try_from(self.limit).unwrap_or(u32::MAX)
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Frames a client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Preview(PreviewRequest),
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|_| ProtocolError::InvalidMessage)?;

        match envelope.kind.as_str() {
            "ping" => Ok(ClientMessage::Ping),
            "preview" => serde_json::from_value::<PreviewRequest>(envelope.payload)
                .map(|request| ClientMessage::Preview(request.normalized()))
                .map_err(|_| ProtocolError::InvalidPreviewRequest),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Stage names as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStage {
    Connecting,
    Connected,
    Selecting,
    Fetching,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub stage: PreviewStage,
    pub current: usize,
    pub total: usize,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_data: Option<Message>,
}

impl ProgressPayload {
    pub fn new(stage: PreviewStage, current: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            stage,
            current,
            total,
            message: message.into(),
            message_data: None,
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.message_data = Some(message);
        self
    }
}

/// Frames the server sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Progress { payload: ProgressPayload },
    #[serde(rename = "result")]
    PreviewResult { payload: PreviewResult },
    Error { error: String },
    Pong,
}

impl ServerMessage {
    pub fn progress(payload: ProgressPayload) -> Self {
        ServerMessage::Progress { payload }
    }

    pub fn error(error: impl ToString) -> Self {
        ServerMessage::Error {
            error: error.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is a plain struct of serializable fields
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to encode preview frame: {}", e);
            r#"{"type":"error","error":"internal error"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_preview_applies_defaults() {
        let msg = ClientMessage::parse(r#"{"type":"preview","payload":{"account_id":3}}"#).unwrap();
        let ClientMessage::Preview(request) = msg else {
            panic!("expected preview");
        };
        assert_eq!(request.account_id, 3);
        assert_eq!(request.folder, "INBOX");
        assert_eq!(request.limit(), 100);

        let msg = ClientMessage::parse(
            r#"{"type":"preview","payload":{"account_id":3,"folder":"Archive","limit":0}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Preview(PreviewRequest {
                account_id: 3,
                folder: "Archive".to_string(),
                limit: 100,
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#), Ok(ClientMessage::Ping));
        assert_eq!(ClientMessage::parse("not json"), Err(ProtocolError::InvalidMessage));
        assert_eq!(
            ClientMessage::parse(r#"{"type":"preview","payload":{"account_id":"x"}}"#),
            Err(ProtocolError::InvalidPreviewRequest)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"preview"}"#),
            Err(ProtocolError::InvalidPreviewRequest)
        );

        let err = ClientMessage::parse(r#"{"type":"subscribe"}"#).unwrap_err();
        assert_eq!(err.to_string(), "unknown message type");
    }

    #[test]
    fn test_server_frames() {
        let pong: Value = serde_json::from_str(&ServerMessage::Pong.to_json()).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));

        let error: Value = serde_json::from_str(&ServerMessage::error("account not found").to_json()).unwrap();
        assert_eq!(error, json!({"type": "error", "error": "account not found"}));

        let progress = ServerMessage::progress(ProgressPayload::new(
            PreviewStage::Connecting,
            0,
            0,
            "Connecting to IMAP server...",
        ));
        let value: Value = serde_json::from_str(&progress.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "progress",
                "payload": {
                    "stage": "connecting",
                    "current": 0,
                    "total": 0,
                    "message": "Connecting to IMAP server..."
                }
            })
        );

        let result = ServerMessage::PreviewResult {
            payload: PreviewResult::default(),
        };
        let value: Value = serde_json::from_str(&result.to_json()).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["payload"]["total_messages"], 0);
    }
}
