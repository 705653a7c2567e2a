//! Moonraker JSON-RPC message framing.
//!
//! Requests always target `printer.gcode.script`. Everything arriving on the
//! socket is classified as either a response (carries an `id`) or a
//! notification (carries a `method`); notifications never complete a call.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method that runs a G-code script on the printer
pub const GCODE_SCRIPT_METHOD: &str = "printer.gcode.script";

/// Broadcast carrying console output from the firmware
pub const GCODE_RESPONSE_NOTIFICATION: &str = "notify_gcode_response";

const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptParams {
    pub script: String,
}

/// A `printer.gcode.script` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: ScriptParams,
    pub id: u64,
}

impl RpcRequest {
    pub fn gcode_script(id: u64, script: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: GCODE_SCRIPT_METHOD.to_string(),
            params: ScriptParams {
                script: script.into(),
            },
            id,
        }
    }
}

/// Error member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: Option<i64>,
    pub message: String,
}

impl RpcError {
    fn from_value(error: &Value) -> Self {
        let code = error.get("code").and_then(Value::as_i64);
        let message = match error.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        };
        Self { code, message }
    }
}

/// One decoded incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Notification {
        method: String,
    },
    /// Valid JSON that is neither of the above
    Other(Value),
}

/// Decode one text frame.
///
/// A message with both `id` and `method` is a request from the server and is
/// treated as a notification.
pub fn classify(text: &str) -> serde_json::Result<RpcMessage> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        return Ok(RpcMessage::Notification {
            method: method.to_string(),
        });
    }

    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        return Ok(RpcMessage::Other(value));
    };

    let outcome = match value.get("error") {
        Some(error) if !error.is_null() => Err(RpcError::from_value(error)),
        _ => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
    };

    Ok(RpcMessage::Response { id, outcome })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = RpcRequest::gcode_script(3, "G91");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "method": "printer.gcode.script",
                "params": {"script": "G91"},
                "id": 3
            })
        );
    }

    #[test]
    fn test_classify_success() {
        let msg = classify(r#"{"jsonrpc":"2.0","result":"ok","id":3}"#).unwrap();
        assert_eq!(
            msg,
            RpcMessage::Response {
                id: 3,
                outcome: Ok(json!("ok"))
            }
        );
    }

    #[test]
    fn test_classify_error() {
        let text = r#"{"jsonrpc":"2.0","error":{"code":400,"message":"Must home axis first"},"id":4}"#;
        match classify(text).unwrap() {
            RpcMessage::Response { id, outcome } => {
                assert_eq!(id, 4);
                let err = outcome.unwrap_err();
                assert_eq!(err.code, Some(400));
                assert_eq!(err.message, "Must home axis first");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_without_message() {
        let text = r#"{"error":"boom","id":1}"#;
        match classify(text).unwrap() {
            RpcMessage::Response { outcome, .. } => {
                let err = outcome.unwrap_err();
                assert_eq!(err.code, None);
                assert_eq!(err.message, "\"boom\"");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let text = r#"{"jsonrpc":"2.0","method":"notify_gcode_response","params":["ok"]}"#;
        assert_eq!(
            classify(text).unwrap(),
            RpcMessage::Notification {
                method: GCODE_RESPONSE_NOTIFICATION.to_string()
            }
        );
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert!(classify("not json").is_err());
        assert!(matches!(
            classify(r#"{"hello":1}"#).unwrap(),
            RpcMessage::Other(_)
        ));
    }
}
