//! Wire records exchanged over the encrypted channel.
//!
//! A decrypted frame is a JSON object whose `mode` field selects the
//! handler. Mode-specific fields are `Option` at the parse layer so a
//! missing field surfaces as a structured failure naming it, rather than a
//! decode error that would tear the session down.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

/// Raw chunk size for file transfers. With base64 expansion (4/3) plus
/// framing and AEAD overhead, each encrypted chunk frame stays under 16 KiB
/// on the wire.
pub const CHUNK_SIZE: usize = 10 * 1024;

/// Request from the controller, discriminated by `mode`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Request {
    /// Run a command and return its exit code and captured streams.
    Command {
        cmd: Option<String>,
        tmp_path: Option<String>,
        executable: Option<String>,
    },
    /// One chunk of a controller-to-daemon file transfer.
    Put {
        /// Base64-encoded chunk payload.
        data: Option<String>,
        out_path: Option<String>,
        #[serde(default)]
        last: bool,
        /// Target owner when delivering into another user's tree.
        user: Option<String>,
    },
    /// Start a daemon-to-controller file transfer.
    Fetch { in_path: Option<String> },
}

/// Outcome of parsing a decrypted payload.
#[derive(Debug)]
pub enum ParsedRequest {
    Known(Request),
    /// The `mode` field named a handler that does not exist.
    Unknown(String),
}

/// Parse a decrypted payload into a request.
///
/// The `mode` discriminator is extracted first so an unrecognized mode can
/// be answered by name instead of closing the session.
pub fn parse_request(payload: &[u8]) -> Result<ParsedRequest> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| RelayError::Protocol(format!("undecodable request: {e}")))?;

    let mode = value
        .get("mode")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Protocol("request has no mode field".into()))?
        .to_string();

    match mode.as_str() {
        "command" | "put" | "fetch" => {
            let request = serde_json::from_value(value)
                .map_err(|e| RelayError::Protocol(format!("malformed {mode} request: {e}")))?;
            Ok(ParsedRequest::Known(request))
        }
        _ => Ok(ParsedRequest::Unknown(mode)),
    }
}

/// Response to the controller.
///
/// Controllers distinguish the shapes by their fields (`pong` vs. result vs.
/// `failed`), so serialization is untagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    /// Final result of a command execution.
    Exec {
        rc: i32,
        stdout: String,
        stderr: String,
    },
    /// Structured failure for the current request.
    Failure { failed: bool, msg: String },
    /// Keepalive emitted while a command is still running.
    Pong { pong: bool },
    /// One fetch chunk (base64 payload, `last` set on the final chunk).
    Chunk { data: String, last: bool },
    /// Empty acknowledgment. Keep this variant last: untagged
    /// deserialization tries variants in order and `{}` matches any object.
    Ack {},
}

impl Response {
    pub fn failure(msg: impl Into<String>) -> Self {
        Response::Failure {
            failed: true,
            msg: msg.into(),
        }
    }

    pub fn pong() -> Self {
        Response::Pong { pong: true }
    }

    pub fn ack() -> Self {
        Response::Ack {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> ParsedRequest {
        parse_request(&serde_json::to_vec(&value).unwrap()).unwrap()
    }

    #[test]
    fn parses_command_request() {
        let parsed = parse(json!({
            "mode": "command",
            "cmd": "uname -a",
            "tmp_path": "/tmp/work",
            "executable": "/bin/sh",
        }));
        match parsed {
            ParsedRequest::Known(Request::Command { cmd, tmp_path, executable }) => {
                assert_eq!(cmd.as_deref(), Some("uname -a"));
                assert_eq!(tmp_path.as_deref(), Some("/tmp/work"));
                assert_eq!(executable.as_deref(), Some("/bin/sh"));
            }
            other => panic!("expected command request, got {other:?}"),
        }
    }

    #[test]
    fn parses_put_request_with_default_last() {
        let parsed = parse(json!({
            "mode": "put",
            "data": "aGVsbG8=",
            "out_path": "/tmp/out.bin",
        }));
        match parsed {
            ParsedRequest::Known(Request::Put { data, out_path, last, user }) => {
                assert_eq!(data.as_deref(), Some("aGVsbG8="));
                assert_eq!(out_path.as_deref(), Some("/tmp/out.bin"));
                assert!(!last);
                assert!(user.is_none());
            }
            other => panic!("expected put request, got {other:?}"),
        }
    }

    #[test]
    fn parses_fetch_request() {
        let parsed = parse(json!({ "mode": "fetch", "in_path": "/etc/hosts" }));
        assert!(matches!(
            parsed,
            ParsedRequest::Known(Request::Fetch { in_path: Some(p) }) if p == "/etc/hosts"
        ));
    }

    #[test]
    fn missing_fields_parse_as_none() {
        // Field validation happens in the handlers, not here.
        let parsed = parse(json!({ "mode": "command" }));
        assert!(matches!(
            parsed,
            ParsedRequest::Known(Request::Command { cmd: None, tmp_path: None, executable: None })
        ));
    }

    #[test]
    fn unknown_mode_is_reported_by_name() {
        let parsed = parse(json!({ "mode": "reboot" }));
        match parsed {
            ParsedRequest::Unknown(mode) => assert_eq!(mode, "reboot"),
            other => panic!("expected unknown mode, got {other:?}"),
        }
    }

    #[test]
    fn missing_mode_is_a_protocol_fault() {
        let result = parse_request(br#"{"cmd": "ls"}"#);
        assert!(matches!(result, Err(RelayError::Protocol(_))));
    }

    #[test]
    fn garbage_payload_is_a_protocol_fault() {
        let result = parse_request(b"\xff\xfe not json");
        assert!(matches!(result, Err(RelayError::Protocol(_))));
    }

    #[test]
    fn response_wire_shapes() {
        assert_eq!(serde_json::to_value(Response::ack()).unwrap(), json!({}));
        assert_eq!(
            serde_json::to_value(Response::pong()).unwrap(),
            json!({ "pong": true })
        );
        assert_eq!(
            serde_json::to_value(Response::failure("nope")).unwrap(),
            json!({ "failed": true, "msg": "nope" })
        );
        assert_eq!(
            serde_json::to_value(Response::Exec {
                rc: 0,
                stdout: "ok\n".into(),
                stderr: String::new(),
            })
            .unwrap(),
            json!({ "rc": 0, "stdout": "ok\n", "stderr": "" })
        );
    }

    #[test]
    fn response_roundtrip() {
        let responses = [
            Response::Exec { rc: 3, stdout: "a".into(), stderr: "b".into() },
            Response::failure("boom"),
            Response::pong(),
            Response::Chunk { data: "aGk=".into(), last: true },
            Response::ack(),
        ];
        for response in responses {
            let bytes = serde_json::to_vec(&response).unwrap();
            let back: Response = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(back, response);
        }
    }
}
