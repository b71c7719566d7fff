//! Wire protocol: inbound `_cmd` messages, outbound `_action` messages, and
//! the command error taxonomy.
//!
//! One JSON object per WebSocket message. Inbound objects carry a `_cmd`
//! discriminator, outbound objects an `_action` discriminator.

use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors produced while dispatching a client command. Not-found and
/// invalid-parameter failures become per-message `error` responses; protocol
/// failures are logged and the message dropped. Neither closes the
/// connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CommandError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

/// Inbound client command.
#[derive(Debug, Deserialize)]
#[serde(tag = "_cmd", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    Watch {
        id: u32,
        device: String,
        channel: String,
        stream: String,
        start_index: usize,
        end_index: usize,
        decimate_factor: usize,
    },
    CancelListen {
        id: u32,
    },
    Configure {
        #[serde(default)]
        device: Option<String>,
        mode: u32,
        samples: usize,
        sample_time: f32,
        #[serde(default)]
        continuous: bool,
        #[serde(default)]
        raw: bool,
    },
    StartCapture {
        #[serde(default)]
        device: Option<String>,
    },
    PauseCapture {
        #[serde(default)]
        device: Option<String>,
    },
    Set {
        #[serde(default)]
        device: Option<String>,
        channel: String,
        #[serde(flatten)]
        source: Value,
    },
    StartStreaming,
    StopStreaming,
    ControlTransfer {
        id: Value,
        #[serde(default)]
        device: Option<String>,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        w_length: u16,
        #[serde(default)]
        data: Option<Value>,
    },
    EnterBootloader {
        #[serde(default)]
        device: Option<String>,
    },
}

impl Command {
    /// Parses one inbound message.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        serde_json::from_str(text).map_err(|e| CommandError::Protocol(e.to_string()))
    }
}

/// Decodes the OUT-transfer payload of a `controlTransfer` command: either a
/// JSON array of bytes or a base64 string.
pub fn decode_transfer_data(data: &Value, length: usize) -> Result<Vec<u8>, CommandError> {
    let mut bytes = match data {
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .filter(|b| *b <= u8::MAX as u64)
                    .map(|b| b as u8)
                    .ok_or_else(|| CommandError::invalid("data array must hold bytes"))
            })
            .collect::<Result<Vec<u8>, _>>()?,
        Value::String(s) => base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| CommandError::invalid(format!("data is not valid base64: {e}")))?,
        _ => return Err(CommandError::invalid("data must be a byte array or base64 string")),
    };
    bytes.truncate(length);
    Ok(bytes)
}

// Outbound message builders. Serialization happens once per recipient at the
// session layer; these just shape the JSON.

pub fn devices_message(devices: Vec<Value>) -> Value {
    json!({ "_action": "devices", "devices": devices })
}

pub fn streamstate_message(streaming: bool) -> Value {
    json!({ "_action": "streamstate", "streaming": streaming })
}

pub fn device_config_message(device: Value) -> Value {
    json!({ "_action": "deviceConfig", "device": device })
}

pub fn capture_state_message(state: &str, done: bool) -> Value {
    json!({ "_action": "captureState", "state": state, "done": done })
}

pub fn capture_reset_message() -> Value {
    json!({ "_action": "captureReset" })
}

pub fn output_changed_message(channel: &str, source: Value) -> Value {
    let mut msg = json!({ "_action": "outputChanged", "channel": channel });
    if let (Value::Object(msg), Value::Object(fields)) = (&mut msg, source) {
        msg.extend(fields);
    }
    msg
}

pub fn update_message(id: u32, idx: usize, data: Vec<f32>, end: bool) -> Value {
    let mut msg = json!({ "_action": "update", "id": id, "idx": idx, "data": data });
    if end {
        msg["end"] = Value::Bool(true);
    }
    msg
}

pub fn control_transfer_return(status: i32, id: &Value, data: Option<&[u8]>) -> Value {
    let mut msg = json!({ "_action": "controlTransferReturn", "status": status, "id": id });
    if let Some(bytes) = data {
        msg["data"] = json!(bytes);
    }
    msg
}

pub fn error_message(err: &CommandError) -> Value {
    json!({ "_action": "error", "message": err.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_parse_watch_command() {
        let cmd = Command::parse(
            r#"{"_cmd":"watch","id":3,"device":"demo~0001","channel":"a","stream":"v",
               "startIndex":0,"endIndex":100,"decimateFactor":4}"#,
        )
        .unwrap();
        match cmd {
            Command::Watch {
                id,
                device,
                channel,
                stream,
                start_index,
                end_index,
                decimate_factor,
            } => {
                assert_eq!(id, 3);
                assert_eq!(device, "demo~0001");
                assert_eq!(channel, "a");
                assert_eq!(stream, "v");
                assert_eq!(start_index, 0);
                assert_eq!(end_index, 100);
                assert_eq!(decimate_factor, 4);
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_configure_defaults() {
        let cmd =
            Command::parse(r#"{"_cmd":"configure","mode":1,"samples":1000,"sampleTime":0.001}"#)
                .unwrap();
        match cmd {
            Command::Configure {
                continuous, raw, ..
            } => {
                assert!(!continuous);
                assert!(!raw);
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_parse_set_collects_source_fields() {
        let cmd = Command::parse(
            r#"{"_cmd":"set","channel":"a","source":"sine","mode":1,
               "offset":2.5,"amplitude":1.0,"period":100}"#,
        )
        .unwrap();
        match cmd {
            Command::Set { channel, source, .. } => {
                assert_eq!(channel, "a");
                assert_eq!(source["source"], "sine");
                assert_eq!(source["period"], 100);
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let err = Command::parse(r#"{"_cmd":"selfDestruct"}"#).unwrap_err();
        assert!(matches!(err, CommandError::Protocol(_)));

        let err = Command::parse("not json at all").unwrap_err();
        assert!(matches!(err, CommandError::Protocol(_)));
    }

    #[test]
    fn test_decode_transfer_data_array_and_base64() {
        let bytes = decode_transfer_data(&json!([1, 2, 3, 255]), 4).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 255]);

        // Longer payloads are truncated to wLength.
        let bytes = decode_transfer_data(&json!([1, 2, 3, 4]), 2).unwrap();
        assert_eq!(bytes, vec![1, 2]);

        let b64 = base64::engine::general_purpose::STANDARD.encode([9u8, 8, 7]);
        let bytes = decode_transfer_data(&json!(b64), 3).unwrap();
        assert_eq!(bytes, vec![9, 8, 7]);

        assert!(decode_transfer_data(&json!([300]), 1).is_err());
        assert!(decode_transfer_data(&json!(12), 1).is_err());
    }

    #[test]
    fn test_update_message_shape() {
        let msg = update_message(7, 40, vec![1.0, 2.0], false);
        assert_eq!(msg["_action"], "update");
        assert_eq!(msg["id"], 7);
        assert_eq!(msg["idx"], 40);
        assert!(msg.get("end").is_none());

        let msg = update_message(7, 40, Vec::new(), true);
        assert_eq!(msg["end"], true);
    }
}
