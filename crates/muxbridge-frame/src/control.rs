use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Frame;
use crate::error::{FrameError, Result};
use crate::json::{self, JsonObject};

/// Protocol version announced in `init`.
pub const PROTOCOL_VERSION: u64 = 1;

/// Connection handshake (connection-scoped).
pub const COMMAND_INIT: &str = "init";
/// Request to open a channel.
pub const COMMAND_OPEN: &str = "open";
/// The channel handler is ready for data.
pub const COMMAND_READY: &str = "ready";
/// Half-close: no more data from the sender.
pub const COMMAND_DONE: &str = "done";
/// Channel (or, without a channel, connection) close.
pub const COMMAND_CLOSE: &str = "close";
/// Flow-control ping; the far side answers with `pong`.
pub const COMMAND_PING: &str = "ping";
/// Flow-control acknowledgement.
pub const COMMAND_PONG: &str = "pong";
/// Change channel options after open.
pub const COMMAND_OPTIONS: &str = "options";
/// Close all channels of a group (connection-scoped).
pub const COMMAND_KILL: &str = "kill";
/// Interactive credential challenge/response (connection-scoped).
pub const COMMAND_AUTHORIZE: &str = "authorize";
/// Sent once a superuser bridge requested in `init` has started or failed.
pub const COMMAND_SUPERUSER_INIT_DONE: &str = "superuser-init-done";

/// Commands that are meaningless without a `channel` field.
const CHANNEL_SCOPED: &[&str] = &[COMMAND_OPEN, COMMAND_READY, COMMAND_DONE, COMMAND_OPTIONS];

/// A control message: a JSON object with a string `command` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlMessage {
    fields: JsonObject,
}

impl ControlMessage {
    /// Create a connection-scoped message.
    pub fn new(command: &str) -> Self {
        let mut fields = JsonObject::new();
        fields.insert("command".to_string(), Value::from(command));
        Self { fields }
    }

    /// Create a message addressed to a channel.
    pub fn for_channel(command: &str, channel: &str) -> Self {
        Self::new(command).with("channel", channel)
    }

    /// Validate an already-decoded JSON object.
    pub fn from_object(fields: JsonObject) -> Result<Self> {
        let command = match fields.get("command") {
            Some(Value::String(command)) => command.as_str(),
            Some(_) => {
                return Err(FrameError::InvalidControl(
                    "'command' must be a string".to_string(),
                ))
            }
            None => {
                return Err(FrameError::InvalidControl(
                    "missing 'command' field".to_string(),
                ))
            }
        };

        let channel = json::typed_str(&fields, "channel").map_err(FrameError::InvalidControl)?;
        if CHANNEL_SCOPED.contains(&command) && channel.map_or(true, str::is_empty) {
            return Err(FrameError::InvalidControl(format!(
                "'{command}' requires a 'channel' field"
            )));
        }

        Ok(Self { fields })
    }

    /// Parse the payload of a control frame.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|err| FrameError::InvalidControl(format!("not valid JSON: {err}")))?;
        match value {
            Value::Object(fields) => Self::from_object(fields),
            _ => Err(FrameError::InvalidControl(
                "control payload must be a JSON object".to_string(),
            )),
        }
    }

    pub fn command(&self) -> &str {
        json::get_str(&self.fields, "command").unwrap_or_default()
    }

    pub fn is(&self, command: &str) -> bool {
        self.command() == command
    }

    pub fn channel(&self) -> Option<&str> {
        json::get_str(&self.fields, "channel").filter(|channel| !channel.is_empty())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        json::get_str(&self.fields, key)
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Copy every field of `extra` into the message, except `command`.
    pub fn extend(&mut self, extra: &JsonObject) {
        for (key, value) in extra {
            if key != "command" {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    /// Replace the command, keeping every other field.
    pub fn set_command(&mut self, command: &str) {
        self.insert("command", command);
    }

    pub fn as_object(&self) -> &JsonObject {
        &self.fields
    }

    pub fn into_object(self) -> JsonObject {
        self.fields
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(Value::Object(self.fields.clone()).to_string())
    }

    /// Wrap into a control frame.
    pub fn to_frame(&self) -> Frame {
        Frame::control(self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_valid_open() {
        let msg = ControlMessage::parse(br#"{"command":"open","channel":"c1","payload":"echo"}"#)
            .unwrap();
        assert!(msg.is(COMMAND_OPEN));
        assert_eq!(msg.channel(), Some("c1"));
        assert_eq!(msg.get_str("payload"), Some("echo"));
    }

    #[test]
    fn reject_missing_command() {
        let err = ControlMessage::parse(br#"{"channel":"c1"}"#).unwrap_err();
        assert!(matches!(err, FrameError::InvalidControl(_)));
    }

    #[test]
    fn reject_non_string_command() {
        let err = ControlMessage::parse(br#"{"command":5}"#).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn reject_non_object_payload() {
        assert!(ControlMessage::parse(b"[1,2]").is_err());
        assert!(ControlMessage::parse(b"{not-json").is_err());
    }

    #[test]
    fn channel_scoped_commands_need_channel() {
        assert!(ControlMessage::parse(br#"{"command":"open","payload":"echo"}"#).is_err());
        assert!(ControlMessage::parse(br#"{"command":"ready","channel":""}"#).is_err());
        assert!(ControlMessage::parse(br#"{"command":"done","channel":7}"#).is_err());
        assert!(ControlMessage::parse(br#"{"command":"ping","sequence":1}"#).is_ok());
        assert!(ControlMessage::parse(br#"{"command":"close"}"#).is_ok());
    }

    #[test]
    fn builder_and_frame() {
        let msg = ControlMessage::for_channel(COMMAND_PING, "c2").with("sequence", 16384);
        let frame = msg.to_frame();
        assert!(frame.is_control());

        let back = ControlMessage::parse(&frame.payload).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.get("sequence"), Some(&json!(16384)));
    }

    #[test]
    fn extend_keeps_command() {
        let mut msg = ControlMessage::for_channel(COMMAND_CLOSE, "c3");
        let extra = match json!({"command": "bogus", "problem": "not-supported"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        msg.extend(&extra);
        assert!(msg.is(COMMAND_CLOSE));
        assert_eq!(msg.get_str("problem"), Some("not-supported"));
    }
}
