use std::time::Instant;

use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::rpc::envelope::ReplyMessage;
use crate::transport::Request;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

pub fn log_frame_summary(request: &Request, reply: &ReplyMessage, started_at: Instant) {
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        sender = %request.sender,
        conn_id = %request.conn_id,
        path = %request.path,
        status = reply.status,
        duration_ms = elapsed_ms,
        "frame summary"
    );
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "credential" | "credentials" | "api_key" | "apikey"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
}
