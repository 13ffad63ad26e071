use std::{fmt, io, net::SocketAddr};

use serde_json::Value;
use thiserror::Error;

use crate::config::ConfigError;
use crate::rpc::envelope::json_rpc_error;

pub const METHOD_NOT_FOUND_STATUS: i32 = -4;

/// Out-of-band status codes a handler attaches to its replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCodes {
    pub success: i32,
    pub default: i32,
    pub server_error: i32,
}

impl Default for StatusCodes {
    fn default() -> Self {
        Self {
            success: 0,
            default: -1,
            server_error: -5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    MissingKey(&'static str),
    InvalidJson(String),
    NotAnObject,
    MethodNotString,
    ParamsNotArray,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey(key) => write!(f, "key '{key}' not found"),
            Self::InvalidJson(error) => write!(f, "invalid JSON: {error}"),
            Self::NotAnObject => f.write_str("envelope is not a JSON object"),
            Self::MethodNotString => f.write_str("key 'method' must be a string"),
            Self::ParamsNotArray => f.write_str("key 'params' must be an array"),
        }
    }
}

/// Failures of a single RPC call. Every variant is turned into an error
/// envelope at the dispatch boundary.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Malformed message '{raw}', {reason}.")]
    MalformedRequest {
        id: Value,
        raw: String,
        reason: MalformedReason,
    },
    #[error("Method '{method}' not found.")]
    MethodNotFound { id: Value, method: String },
    #[error("{kind}: {message}{}", trace_suffix(.trace))]
    Execution {
        id: Value,
        method: String,
        kind: String,
        message: String,
        trace: String,
    },
}

fn trace_suffix(trace: &str) -> String {
    if trace.is_empty() {
        String::new()
    } else {
        format!("\n{trace}")
    }
}

impl RpcError {
    pub fn malformed(id: Value, raw: impl Into<String>, reason: MalformedReason) -> Self {
        Self::MalformedRequest {
            id,
            raw: raw.into(),
            reason,
        }
    }

    pub fn method_not_found(id: Value, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            id,
            method: method.into(),
        }
    }

    pub fn id(&self) -> &Value {
        match self {
            Self::MalformedRequest { id, .. }
            | Self::MethodNotFound { id, .. }
            | Self::Execution { id, .. } => id,
        }
    }

    pub fn status(&self, codes: &StatusCodes) -> i32 {
        match self {
            Self::MalformedRequest { .. } => codes.default,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND_STATUS,
            Self::Execution { .. } => codes.server_error,
        }
    }

    pub fn to_envelope(&self) -> Value {
        json_rpc_error(self.id().clone(), self.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to connect to broker {role} socket at {addr}: {source}")]
    Connect {
        role: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read from broker: {0}")]
    Read(#[source] io::Error),
    #[error("failed to send reply: {0}")]
    Send(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
