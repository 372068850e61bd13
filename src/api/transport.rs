use crate::types::{ModelMessage, ToolSpec, TransportEvent};
use futures::future::BoxFuture;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Text deltas followed by exactly one [`TransportEvent::Final`] on success.
/// An `Err` item ends the response.
pub type TransportStream = Pin<Box<dyn Stream<Item = anyhow::Result<TransportEvent>> + Send>>;

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<ModelMessage>,
    /// Empty when tools are disabled for the turn.
    pub tools: Vec<ToolSpec>,
    /// Cancelling aborts the request and ends its stream.
    pub cancel: CancellationToken,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach API endpoint '{url}': {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("API request to '{url}' timed out")]
    Timeout {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("API endpoint '{url}' returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("API request to '{url}' failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("request cancelled")]
    Cancelled,
}

/// Opaque "send messages, stream back a response" capability.
pub trait ModelTransport: Send + Sync {
    fn send(&self, request: ModelRequest) -> BoxFuture<'_, Result<TransportStream, TransportError>>;
}
