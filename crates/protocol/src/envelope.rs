use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error details in a WebSocket message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// Envelope for all WebSocket communication.
///
/// `id` is the correlation identifier: a `command` carries a fresh one and
/// the agent's `command_result` echoes it back. Unsolicited pushes leave it
/// empty, and it is then omitted on the wire.
///
/// The `payload` field stays as raw JSON so the hub can forward command and
/// result bodies without decoding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl Message {
    /// Creates a new message with the given correlation id, type and payload.
    pub fn new<T: Serialize + ?Sized>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => Some(serde_json::value::to_raw_value(p)?),
            None => None,
        };
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: raw,
            error: None,
        })
    }

    /// Creates an uncorrelated push message.
    pub fn push<T: Serialize + ?Sized>(
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Message::new(String::new(), msg_type, Some(payload))
    }

    /// Returns `true` if the message carries a correlation identifier.
    pub fn is_correlated(&self) -> bool {
        !self.id.is_empty()
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Returns the raw payload JSON, if any.
    pub fn payload_json(&self) -> Option<&str> {
        self.payload.as_deref().map(|raw| raw.get())
    }

    /// Creates an error message.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WsError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Creates a response message for this request.
    pub fn reply<T: Serialize + ?Sized>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(self.id.clone(), msg_type, payload)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(self.id.clone(), code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_carries_correlation_id() {
        let msg = Message::new("c1", MessageType::Command, Some("list_files")).unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], "c1");
        assert_eq!(json["type"], "command");
        assert_eq!(json["payload"], "list_files");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn push_omits_id() {
        let msg = Message::push(MessageType::ShellOutput, &serde_json::json!({"output": "hi"}))
            .unwrap();
        assert!(!msg.is_correlated());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn parses_frame_without_id() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"shell_output","payload":{"stdout":"ok"}}"#).unwrap();
        assert!(msg.id.is_empty());
        assert_eq!(msg.msg_type, MessageType::ShellOutput);
        assert_eq!(msg.payload_json(), Some(r#"{"stdout":"ok"}"#));
    }

    #[test]
    fn payload_is_forwarded_verbatim() {
        let msg: Message = serde_json::from_str(
            r#"{"id":"c1","type":"command_result","payload":["a.txt", "b.txt"]}"#,
        )
        .unwrap();
        assert_eq!(msg.payload_json(), Some(r#"["a.txt", "b.txt"]"#));
        let files: Option<Vec<String>> = msg.parse_payload().unwrap();
        assert_eq!(files.unwrap(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn reply_error_preserves_id() {
        let original = Message::new::<()>("req-99", MessageType::ListClients, None).unwrap();
        let reply = original.reply_error(404, "not found");
        assert_eq!(reply.id, "req-99");
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, 404);
    }
}
