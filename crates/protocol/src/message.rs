use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version advertised in `welcome` and expected in client requests.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Every message exchanged over the control channel (spec.md §4.5).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Welcome {
        version: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        #[serde(rename = "authRequired")]
        auth_required: bool,
    },
    Auth {
        version: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        token: String,
    },
    AuthSuccess {
        version: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        id: String,
    },
    Command {
        version: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        id: String,
        command: String,
        #[serde(default)]
        args: Value,
    },
    Response {
        version: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Error {
        version: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: ErrorPayload,
    },
    Event {
        version: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        event: String,
        data: Value,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

impl Message {
    pub fn welcome(auth_required: bool) -> Self {
        Message::Welcome {
            version: PROTOCOL_VERSION.into(),
            timestamp: chrono::Utc::now(),
            auth_required,
        }
    }

    pub fn auth(token: impl Into<String>) -> Self {
        Message::Auth {
            version: PROTOCOL_VERSION.into(),
            timestamp: chrono::Utc::now(),
            token: token.into(),
        }
    }

    pub fn auth_success(id: impl Into<String>) -> Self {
        Message::AuthSuccess {
            version: PROTOCOL_VERSION.into(),
            timestamp: chrono::Utc::now(),
            id: id.into(),
        }
    }

    pub fn command(id: impl Into<String>, command: impl Into<String>, args: Value) -> Self {
        Message::Command {
            version: PROTOCOL_VERSION.into(),
            timestamp: chrono::Utc::now(),
            id: id.into(),
            command: command.into(),
            args,
        }
    }

    pub fn response_ok(id: impl Into<String>, result: Value) -> Self {
        Message::Response {
            version: PROTOCOL_VERSION.into(),
            timestamp: chrono::Utc::now(),
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: impl Into<String>, message: impl Into<String>, code: impl Into<String>) -> Self {
        Message::Response {
            version: PROTOCOL_VERSION.into(),
            timestamp: chrono::Utc::now(),
            id: id.into(),
            success: false,
            result: None,
            error: Some(ErrorPayload {
                message: message.into(),
                code: code.into(),
            }),
        }
    }

    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Message::Event {
            version: PROTOCOL_VERSION.into(),
            timestamp: chrono::Utc::now(),
            event: event.into(),
            data,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_message_serializes_with_kebab_case_tag() {
        let msg = Message::command("req-1", "daemon.status", Value::Null);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"command""#));
        assert!(json.contains(r#""command":"daemon.status""#));
    }

    #[test]
    fn response_roundtrips_through_bytes() {
        let msg = Message::response_ok("req-1", serde_json::json!({"ok": true}));
        let bytes = msg.to_bytes().unwrap();
        let parsed = Message::from_bytes(&bytes).unwrap();
        match parsed {
            Message::Response { id, success, .. } => {
                assert_eq!(id, "req-1");
                assert!(success);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
