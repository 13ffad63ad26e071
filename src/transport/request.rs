//! Parsed broker requests

use serde_json::{Map, Value};

use super::codec::{decode_request, FramingError, RequestFrame};

pub const PATH_HEADER: &str = "PATH";
pub const METHOD_HEADER: &str = "METHOD";
/// Request method the broker uses for its own control messages.
pub const DISCONNECT_METHOD: &str = "JSON";

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub sender: String,
    pub conn_id: String,
    pub path: String,
    pub headers: Map<String, Value>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parses a single complete frame.
    pub fn parse(frame: &[u8]) -> Result<Self, FramingError> {
        let (frame, _) = decode_request(frame)?;
        Self::from_frame(frame)
    }

    pub fn from_frame(frame: RequestFrame) -> Result<Self, FramingError> {
        let headers: Map<String, Value> = serde_json::from_slice(&frame.headers)
            .map_err(|error| FramingError::InvalidHeaders(error.to_string()))?;
        let path = headers
            .get(PATH_HEADER)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            sender: frame.sender,
            conn_id: frame.conn_id,
            path,
            headers,
            body: frame.body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn method(&self) -> Option<&str> {
        self.header(METHOD_HEADER).and_then(Value::as_str)
    }

    /// A broker control message announcing that the peer connection closed.
    pub fn is_disconnect(&self) -> bool {
        if self.method() != Some(DISCONNECT_METHOD) {
            return false;
        }

        serde_json::from_slice::<Value>(&self.body)
            .ok()
            .is_some_and(|body| body.get("type").and_then(Value::as_str) == Some("disconnect"))
    }
}
