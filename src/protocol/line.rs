// src/protocol/line.rs

//! The `Line` frame and its newline-delimited JSON codec.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{AthomeError, Result};
use crate::types::Env;

/// Reserved message names.
pub mod messages {
    pub const READY: &str = "ready";
    pub const START: &str = "start";
    pub const STARTED: &str = "started";
    pub const STOP: &str = "stop";
    pub const EXIT: &str = "exit";
    pub const RESPONSE: &str = "response";
    pub const LOG: &str = "log";
}

/// One protocol frame.
///
/// `req_id` present means one half of a request/response pair; absent means a
/// one-way notification. Field order on the wire is `req_id`, `message`,
/// `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    #[serde(default)]
    pub req_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

impl Line {
    pub fn notification(message: impl Into<String>, payload: Value) -> Self {
        Self {
            req_id: None,
            message: message.into(),
            payload,
        }
    }

    pub fn request(req_id: impl Into<String>, message: impl Into<String>, payload: Value) -> Self {
        Self {
            req_id: Some(req_id.into()),
            message: message.into(),
            payload,
        }
    }

    /// A bare control frame such as `ready`, `started`, `stop` or `exit`.
    pub fn control(message: &str) -> Self {
        Self::notification(message, Value::Null)
    }

    /// Reply to `req_id`: `{"response": value}` on success, `{"error": msg}`
    /// otherwise.
    pub fn response(req_id: Option<String>, outcome: std::result::Result<Value, String>) -> Self {
        let payload = match outcome {
            Ok(value) => json!({ "response": value }),
            Err(error) => json!({ "response": Value::Null, "error": error }),
        };
        Self {
            req_id,
            message: messages::RESPONSE.to_string(),
            payload,
        }
    }

    pub fn is(&self, message: &str) -> bool {
        self.message == message
    }

    pub fn is_request(&self) -> bool {
        self.req_id.is_some() && !self.is(messages::RESPONSE)
    }

    /// Unwrap a `response` payload into the value or the remote error.
    pub fn into_response(self) -> Result<Value> {
        let Value::Object(mut fields) = self.payload else {
            return Err(AthomeError::protocol(format!(
                "response payload must be an object, got {}",
                self.payload
            )));
        };
        if let Some(error) = fields.remove("error").filter(|e| !e.is_null()) {
            let error = match error {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(anyhow::anyhow!("remote error: {error}").into());
        }
        Ok(fields.remove("response").unwrap_or(Value::Null))
    }
}

/// Payload of the `start` handshake line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub env: Env,
    #[serde(default)]
    pub subsystem_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Payload of a `log` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: String,
    pub message: String,
}

/// Encode one frame, newline included.
pub fn encode_line(line: &Line) -> Result<String> {
    let mut text = serde_json::to_string(line)?;
    text.push('\n');
    Ok(text)
}

/// Decode one frame. Anything that is not a `Line` object is a
/// `ProtocolViolation`.
pub fn decode_line(text: &str) -> Result<Line> {
    let text = text.trim_end_matches(['\n', '\r']);
    serde_json::from_str(text)
        .map_err(|e| AthomeError::protocol(format!("malformed line {text:?}: {e}")))
}

/// Read one `\n`-terminated line into `buf`, terminator stripped. Bytes are
/// kept raw so invalid UTF-8 is left to the caller. False at end of stream.
pub async fn read_raw_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(true)
}

/// Write one frame and flush it.
pub async fn write_line<W>(writer: &mut W, line: &Line) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let text = encode_line(line)?;
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_line_matches_wire_format() {
        let text = encode_line(&Line::control(messages::READY)).unwrap();
        assert_eq!(text, "{\"req_id\":null,\"message\":\"ready\",\"payload\":null}\n");
    }

    #[test]
    fn missing_fields_default_to_null() {
        let line = decode_line("{\"message\":\"stop\"}").unwrap();
        assert_eq!(line, Line::control(messages::STOP));
    }

    #[test]
    fn garbage_is_a_protocol_violation() {
        for text in ["hello world", "[1,2]", "{\"req_id\":\"x\"}", ""] {
            let err = decode_line(text).unwrap_err();
            assert!(matches!(err, AthomeError::ProtocolViolation(_)), "{text}");
        }
    }

    #[test]
    fn response_helpers() {
        let ok = Line::response(Some("abc".into()), Ok(json!("pong")));
        assert!(!ok.is_request());
        assert_eq!(ok.into_response().unwrap(), json!("pong"));

        let err = Line::response(Some("abc".into()), Err("nope".into()));
        let msg = err.into_response().unwrap_err().to_string();
        assert!(msg.contains("nope"), "{msg}");
    }

    #[tokio::test]
    async fn raw_lines_keep_invalid_utf8() {
        let input: &[u8] = b"{\"message\":\"ready\"}\r\n\xff\xfe\nlast";
        let mut reader = tokio::io::BufReader::new(input);
        let mut buf = Vec::new();

        assert!(read_raw_line(&mut reader, &mut buf).await.unwrap());
        assert_eq!(decode_line(&String::from_utf8_lossy(&buf)).unwrap(), Line::control(messages::READY));
        assert!(read_raw_line(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"\xff\xfe");
        assert!(read_raw_line(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, b"last");
        assert!(!read_raw_line(&mut reader, &mut buf).await.unwrap());
    }

    #[test]
    fn start_payload_accepts_partial_env() {
        let line = decode_line(
            r#"{"req_id":null,"message":"start","payload":{"env":{"run_dir":"."},"subsystem_config":{}}}"#,
        )
        .unwrap();
        let start: StartPayload = serde_json::from_value(line.payload).unwrap();
        assert_eq!(start.env.run_dir, std::path::PathBuf::from("."));
        assert_eq!(start.name, None);
    }
}
