//! JSON-RPC envelope shapes
//!
//! Builds the result and error objects returned to clients and carries the
//! out-of-band status next to them.

use serde_json::{json, Map, Value};

pub const VERSION: &str = "version";
pub const JSONRPC: &str = "jsonrpc";

#[derive(Debug, Clone, PartialEq)]
pub struct RpcResult {
    pub id: Value,
    pub error: Option<Value>,
    pub result: Value,
}

impl RpcResult {
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            id,
            error: None,
            result,
        }
    }

    pub fn into_value(self) -> Value {
        json!({
            "id": self.id,
            "error": self.error,
            "result": self.result
        })
    }
}

/// The JSON body sent back to the client plus the status the handler set.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMessage {
    pub status: i32,
    pub body: Value,
}

impl ReplyMessage {
    pub fn new(status: i32, body: Value) -> Self {
        Self { status, body }
    }

    pub fn error(status: i32, id: Value, message: impl Into<String>) -> Self {
        Self::new(status, json_rpc_error(id, message))
    }

    pub fn is_error(&self) -> bool {
        is_json_rpc_error(&self.body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.body)
    }
}

pub fn is_json_rpc_error(value: &Value) -> bool {
    value.get("error").is_some_and(|error| !error.is_null())
}

pub fn json_rpc_error(id: Value, message: impl Into<String>) -> Value {
    json!({
        "id": id,
        "error": {
            "message": message.into()
        }
    })
}

/// Copies the request's `version`, or failing that its `jsonrpc`, field
/// into the response unchanged.
pub fn echo_version(request: &Map<String, Value>, response: &mut Value) {
    let Some(response) = response.as_object_mut() else {
        return;
    };

    if let Some(version) = request.get(VERSION) {
        response.insert(VERSION.to_string(), version.clone());
    } else if let Some(jsonrpc) = request.get(JSONRPC) {
        response.insert(JSONRPC.to_string(), jsonrpc.clone());
    }
}
