use super::transport::{ModelRequest, ModelTransport, TransportError, TransportStream};
use crate::types::{FinalMessage, ToolCall, TransportEvent};
use futures::future::BoxFuture;
use futures::stream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Text(String),
    Final(FinalMessage),
    Fail(String),
    /// Keeps the stream open until the request is cancelled.
    Hang,
}

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Reject(String),
    Stream(Vec<ScriptStep>),
}

impl ScriptedResponse {
    /// Streams `text` in one delta and finishes without tool calls.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![
            ScriptStep::Text(text.to_string()),
            ScriptStep::Final(FinalMessage {
                text: text.to_string(),
                tool_calls: Vec::new(),
            }),
        ])
    }

    pub fn tool_calls(text: &str, calls: Vec<ToolCall>) -> Self {
        let mut steps = Vec::new();
        if !text.is_empty() {
            steps.push(ScriptStep::Text(text.to_string()));
        }
        steps.push(ScriptStep::Final(FinalMessage {
            text: text.to_string(),
            tool_calls: calls,
        }));
        Self::Stream(steps)
    }
}

/// Plays back canned responses in order and records every request it sees.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            requests: Arc::default(),
        }
    }

    pub fn push_response(&self, response: ScriptedResponse) {
        lock(&self.responses).push_back(response);
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ModelTransport for ScriptedTransport {
    fn send(&self, request: ModelRequest) -> BoxFuture<'_, Result<TransportStream, TransportError>> {
        let cancel = request.cancel.clone();
        lock(&self.requests).push(request);
        let response = lock(&self.responses).pop_front();

        Box::pin(async move {
            match response {
                None => Err(TransportError::Rejected(
                    "ScriptedTransport: no more responses configured".to_string(),
                )),
                Some(ScriptedResponse::Reject(reason)) => Err(TransportError::Rejected(reason)),
                Some(ScriptedResponse::Stream(steps)) => Ok(play(steps, cancel)),
            }
        })
    }
}

fn play(steps: Vec<ScriptStep>, cancel: CancellationToken) -> TransportStream {
    let steps: VecDeque<ScriptStep> = steps.into();
    Box::pin(stream::unfold(steps, move |mut steps| {
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return None;
            }
            let item = match steps.pop_front()? {
                ScriptStep::Text(text) => Ok(TransportEvent::Text(text)),
                ScriptStep::Final(message) => Ok(TransportEvent::Final(message)),
                ScriptStep::Fail(reason) => {
                    steps.clear();
                    Err(anyhow::anyhow!(reason))
                }
                ScriptStep::Hang => {
                    cancel.cancelled().await;
                    return None;
                }
            };
            // Yield between events so other tasks can observe partial progress.
            tokio::task::yield_now().await;
            Some((item, steps))
        }
    }))
}
