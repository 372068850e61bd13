use super::stream::{decode_events, ByteStream};
use super::transport::{ModelRequest, ModelTransport, TransportError, TransportStream};
use crate::config::Config;
use crate::types::api::{ApiMessage, ApiRequest, ApiTool, ContentBlock};
use crate::types::ModelMessage;
use crate::util::is_local_endpoint_url;
use futures::future::BoxFuture;
use futures::StreamExt;

/// Streams responses from an Anthropic messages compatible endpoint.
#[derive(Clone)]
pub struct AnthropicTransport {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    api_url: String,
    anthropic_version: String,
    max_tokens: u32,
}

impl AnthropicTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            api_url: config.api_url.clone(),
            anthropic_version: config.anthropic_version.clone(),
            max_tokens: config.max_tokens,
        }
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }

    fn build_payload(&self, request: &ModelRequest) -> ApiRequest {
        let (system, messages) = to_api_messages(&request.messages);
        ApiRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system,
            messages,
            tools: request
                .tools
                .iter()
                .map(|tool| ApiTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                })
                .collect(),
            stream: true,
        }
    }

    async fn open_stream(&self, request: ModelRequest) -> Result<TransportStream, TransportError> {
        let payload = self.build_payload(&request);
        tracing::debug!(
            url = %self.api_url,
            model = %self.model,
            messages = payload.messages.len(),
            tools = payload.tools.len(),
            "sending model request"
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            if let Ok(body) = serde_json::to_string_pretty(&payload) {
                tracing::trace!(payload = %body, "model request payload");
            }
        }

        let mut http_request = self
            .http
            .post(&self.api_url)
            .header("content-type", "application/json")
            .json(&payload);
        if let Some(api_key) = &self.api_key {
            http_request = http_request.header("x-api-key", api_key);
        }
        if !self.anthropic_version.trim().is_empty() {
            http_request = http_request.header("anthropic-version", &self.anthropic_version);
        }

        let response = tokio::select! {
            _ = request.cancel.cancelled() => return Err(TransportError::Cancelled),
            response = http_request.send() => {
                response.map_err(|error| map_request_error(error, &self.api_url))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                url: self.api_url.clone(),
                status: status.as_u16(),
                body: summarize_body(&body),
            });
        }

        let url = self.api_url.clone();
        let bytes: ByteStream = Box::pin(response.bytes_stream().map(move |item| {
            item.map_err(|error| anyhow::Error::new(map_request_error(error, &url)))
        }));
        Ok(Box::pin(
            decode_events(bytes).take_until(request.cancel.cancelled_owned()),
        ))
    }
}

impl ModelTransport for AnthropicTransport {
    fn send(&self, request: ModelRequest) -> BoxFuture<'_, Result<TransportStream, TransportError>> {
        Box::pin(self.open_stream(request))
    }
}

fn map_request_error(error: reqwest::Error, url: &str) -> TransportError {
    let url = url.to_string();
    if error.is_connect() {
        TransportError::Unreachable { url, source: error }
    } else if error.is_timeout() {
        TransportError::Timeout { url, source: error }
    } else {
        TransportError::Request { url, source: error }
    }
}

fn summarize_body(body: &str) -> String {
    const LIMIT: usize = 512;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Splits out system text and rebuilds the strict user/assistant alternation
/// the endpoint expects. Each tool message becomes a `tool_use` block on the
/// assistant turn before it plus a `tool_result` block on the user turn after.
pub fn to_api_messages(messages: &[ModelMessage]) -> (Option<String>, Vec<ApiMessage>) {
    let mut system = Vec::new();
    let mut out: Vec<ApiMessage> = Vec::new();

    for message in messages {
        match message {
            ModelMessage::System { content } => {
                if !content.trim().is_empty() {
                    system.push(content.clone());
                }
            }
            ModelMessage::User { content } => push_text(&mut out, "user", content),
            ModelMessage::Assistant { content } => push_text(&mut out, "assistant", content),
            ModelMessage::Tool {
                id,
                name,
                params,
                content,
            } => {
                let tool_use = ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: serde_json::from_str(params)
                        .unwrap_or_else(|_| serde_json::json!({})),
                };
                let tool_result = ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: content.clone(),
                };

                let len = out.len();
                let follows_results = len >= 2
                    && is_tool_results(&out[len - 1])
                    && out[len - 2].role == "assistant";
                if follows_results {
                    out[len - 2].content.push(tool_use);
                    out[len - 1].content.push(tool_result);
                } else {
                    push_block(&mut out, "assistant", tool_use);
                    out.push(ApiMessage {
                        role: "user".to_string(),
                        content: vec![tool_result],
                    });
                }
            }
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, out)
}

fn is_tool_results(message: &ApiMessage) -> bool {
    message.role == "user"
        && !message.content.is_empty()
        && message
            .content
            .iter()
            .all(|block| matches!(block, ContentBlock::ToolResult { .. }))
}

fn push_text(out: &mut Vec<ApiMessage>, role: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    push_block(
        out,
        role,
        ContentBlock::Text {
            text: text.to_string(),
        },
    );
}

fn push_block(out: &mut Vec<ApiMessage>, role: &str, block: ContentBlock) {
    match out.last_mut() {
        Some(last) if last.role == role => last.content.push(block),
        _ => out.push(ApiMessage {
            role: role.to_string(),
            content: vec![block],
        }),
    }
}
