//! JSON-RPC call dispatch
//!
//! Decodes the request body, resolves the method in the handler's
//! [`MethodTable`], runs it, and turns every outcome into a [`ReplyMessage`].

use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::{
    task::{JoinError, JoinHandle},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::errors::{MalformedReason, RpcError, StatusCodes};
use crate::logging::redact_audit_params;
use crate::router::MessageHandler;
use crate::rpc::envelope::{echo_version, ReplyMessage, RpcResult, JSONRPC};
use crate::rpc::registry::{
    BoundMethod, MethodError, MethodResult, MethodTable, Params, RegistryError, RpcMethods,
};
use crate::transport::Request;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    pub status: StatusCodes,
    pub call_timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            status: StatusCodes::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct JsonRpcHandler {
    methods: MethodTable,
    status: StatusCodes,
    call_timeout: Duration,
    abandoned: Arc<AtomicUsize>,
}

impl JsonRpcHandler {
    pub fn new<H: RpcMethods>(service: H, options: HandlerOptions) -> Result<Self, RegistryError> {
        Self::from_shared(Arc::new(service), options)
    }

    pub fn from_shared<H: RpcMethods>(
        service: Arc<H>,
        options: HandlerOptions,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            methods: MethodTable::bind(service)?,
            status: options.status,
            call_timeout: options.call_timeout,
            abandoned: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn status_codes(&self) -> StatusCodes {
        self.status
    }

    /// Timed-out calls whose method body is still running on the blocking pool.
    pub fn abandoned_calls(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Runs one call. Failures are reported inside the returned reply.
    pub async fn handle(&self, request: &Request) -> ReplyMessage {
        let data = match decode_envelope(&request.body) {
            Ok(data) => data,
            Err(error) => {
                let reply = ReplyMessage::new(error.status(&self.status), error.to_envelope());
                audit(None, None, &reply);
                return reply;
            }
        };

        let outcome = if data.contains_key(JSONRPC) {
            self.process_v2(&data).await
        } else {
            self.process_v1(&data).await
        };

        let (status, mut body) = match outcome {
            Ok(result) => (self.status.success, result.into_value()),
            Err(error) => {
                if let RpcError::Execution { method, .. } = &error {
                    warn!(method = %method, error = %error, "rpc method failed");
                }
                (error.status(&self.status), error.to_envelope())
            }
        };
        echo_version(&data, &mut body);

        let reply = ReplyMessage::new(status, body);
        audit(
            data.get("method").and_then(Value::as_str),
            data.get("params"),
            &reply,
        );
        reply
    }

    async fn process_v1(&self, data: &Map<String, Value>) -> Result<RpcResult, RpcError> {
        let id = data
            .get("id")
            .cloned()
            .ok_or_else(|| malformed(data, MalformedReason::MissingKey("id")))?;
        let method = data
            .get("method")
            .ok_or_else(|| malformed(data, MalformedReason::MissingKey("method")))?;
        let params = data
            .get("params")
            .ok_or_else(|| malformed(data, MalformedReason::MissingKey("params")))?;
        let method = method
            .as_str()
            .ok_or_else(|| malformed(data, MalformedReason::MethodNotString))?;
        let params = params
            .as_array()
            .ok_or_else(|| malformed(data, MalformedReason::ParamsNotArray))?;

        let Some(call) = self.methods.get(method) else {
            return Err(RpcError::method_not_found(id, method));
        };

        match self.invoke(call, Params::new(params.clone())).await {
            Ok(result) => Ok(RpcResult::new(id, result)),
            Err(error) => Err(RpcError::Execution {
                id,
                method: method.to_string(),
                trace: error.trace_text(),
                kind: error.kind,
                message: error.message,
            }),
        }
    }

    /// 2.0 envelopes are accepted but handled exactly like 1.x ones.
    async fn process_v2(&self, data: &Map<String, Value>) -> Result<RpcResult, RpcError> {
        self.process_v1(data).await
    }

    async fn invoke(&self, call: BoundMethod, params: Params) -> Result<Value, MethodError> {
        let mut task = tokio::task::spawn_blocking(move || call(params));
        let finished = timeout(self.call_timeout, &mut task).await;
        match finished {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(join_failure(join_error)),
            Err(_) => {
                self.track_abandoned(task);
                Err(MethodError::new(
                    "Timeout",
                    format!(
                        "method did not finish within {} ms",
                        self.call_timeout.as_millis()
                    ),
                ))
            }
        }
    }

    /// The blocking thread cannot be reclaimed early, so count it until the
    /// method body returns.
    fn track_abandoned(&self, task: JoinHandle<MethodResult>) {
        let abandoned = self.abandoned.fetch_add(1, Ordering::SeqCst) + 1;
        info!(abandoned, "timed out call still occupies a blocking thread");

        let counter = Arc::clone(&self.abandoned);
        tokio::spawn(async move {
            let _ = task.await;
            let remaining = counter.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!(abandoned = remaining, "timed out call finished");
        });
    }
}

#[async_trait]
impl MessageHandler for JsonRpcHandler {
    async fn handle(&self, request: &Request) -> ReplyMessage {
        JsonRpcHandler::handle(self, request).await
    }
}

fn decode_envelope(body: &[u8]) -> Result<Map<String, Value>, RpcError> {
    let raw = || String::from_utf8_lossy(body).into_owned();
    let value: Value = serde_json::from_slice(body).map_err(|error| {
        RpcError::malformed(
            Value::Null,
            raw(),
            MalformedReason::InvalidJson(error.to_string()),
        )
    })?;

    match value {
        Value::Object(data) => Ok(data),
        _ => Err(RpcError::malformed(
            Value::Null,
            raw(),
            MalformedReason::NotAnObject,
        )),
    }
}

fn malformed(data: &Map<String, Value>, reason: MalformedReason) -> RpcError {
    RpcError::malformed(
        data.get("id").cloned().unwrap_or(Value::Null),
        Value::Object(data.clone()).to_string(),
        reason,
    )
}

fn join_failure(error: JoinError) -> MethodError {
    if !error.is_panic() {
        return MethodError::new("Cancelled", "method task was cancelled");
    }
    MethodError::new("Panic", panic_message(error.into_panic().as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "method panicked".to_string()
    }
}

fn audit(method: Option<&str>, params: Option<&Value>, reply: &ReplyMessage) {
    info!(
        method = method.unwrap_or("<none>"),
        params = %redact_audit_params(params),
        outcome = if reply.is_error() { "failure" } else { "success" },
        status = reply.status,
        "rpc call audited"
    );
}
