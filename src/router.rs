//! Path based routing of broker requests to handlers

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::errors::StatusCodes;
use crate::rpc::envelope::ReplyMessage;
use crate::transport::Request;

/// Processes one non-disconnect request and produces its reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, request: &Request) -> ReplyMessage;
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Routes are tried in registration order; the first pattern matching the
/// request path wins.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<(Regex, Arc<dyn MessageHandler>)>,
    status: StatusCodes,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: StatusCodes) -> Self {
        self.status = status;
        self
    }

    pub fn route(
        mut self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, RouteError> {
        let regex = Regex::new(pattern).map_err(|source| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        self.routes.push((regex, handler));
        Ok(self)
    }

    pub fn resolve(&self, request: &Request) -> Option<Arc<dyn MessageHandler>> {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.is_match(&request.path))
            .map(|(_, handler)| Arc::clone(handler))
    }

    pub async fn dispatch(&self, request: &Request) -> ReplyMessage {
        match self.resolve(request) {
            Some(handler) => handler.handle(request).await,
            None => ReplyMessage::error(
                self.status.default,
                Value::Null,
                format!("No handler for path '{}'.", request.path),
            ),
        }
    }
}
