use crate::types::api::{ContentBlock, StreamEvent};
use crate::types::{FinalMessage, ToolCall, TransportEvent};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Splits an SSE byte stream into [`StreamEvent`]s. Chunks may end anywhere,
/// including inside a multi-byte character.
#[derive(Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(end) = find_event_end(&self.buffer[start..]) {
            let event_end = start + end + 2;
            let event_text = String::from_utf8_lossy(&self.buffer[start..event_end]);

            let mut event_type = None;
            let mut data = None;
            for line in event_text.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_type = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data = Some(rest.trim().to_string());
                }
            }
            start = event_end;

            let Some(json_data) = data else {
                continue;
            };
            if json_data == "[DONE]" || event_type.as_deref() == Some("ping") {
                continue;
            }

            match serde_json::from_str::<StreamEvent>(&json_data) {
                Ok(StreamEvent::Unknown) => {}
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        event_type = event_type.as_deref().unwrap_or("<none>"),
                        data = %json_data,
                        "skipping unparseable SSE event"
                    );
                }
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }

        Ok(events)
    }

    pub fn flush(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned()
    }
}

fn find_event_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|pair| pair == b"\n\n")
}

struct PendingToolUse {
    id: String,
    name: String,
    input: serde_json::Value,
    partial_json: String,
}

/// Folds message events into text deltas and the final assembled message.
#[derive(Default)]
struct MessageAssembler {
    text: String,
    tools: BTreeMap<usize, PendingToolUse>,
}

impl MessageAssembler {
    fn handle(&mut self, event: StreamEvent, out: &mut VecDeque<TransportEvent>) -> Result<bool> {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text } => self.push_text(text, out),
                ContentBlock::ToolUse { id, name, input } => {
                    self.tools.insert(
                        index,
                        PendingToolUse {
                            id,
                            name,
                            input,
                            partial_json: String::new(),
                        },
                    );
                }
                ContentBlock::ToolResult { .. } => {}
            },
            StreamEvent::ContentBlockDelta { index, delta } => {
                if let Some(text) = delta.text {
                    self.push_text(text, out);
                }
                if let Some(partial_json) = delta.partial_json {
                    if let Some(tool) = self.tools.get_mut(&index) {
                        tool.partial_json.push_str(&partial_json);
                    }
                }
            }
            StreamEvent::MessageStop {} => {
                out.push_back(TransportEvent::Final(self.finish()));
                return Ok(true);
            }
            StreamEvent::Error { error } => {
                return Err(anyhow!("model stream error ({}): {}", error.kind, error.message));
            }
            StreamEvent::MessageStart {}
            | StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageDelta {}
            | StreamEvent::Unknown => {}
        }
        Ok(false)
    }

    fn push_text(&mut self, text: String, out: &mut VecDeque<TransportEvent>) {
        if text.is_empty() {
            return;
        }
        self.text.push_str(&text);
        out.push_back(TransportEvent::Text(text));
    }

    fn finish(&mut self) -> FinalMessage {
        let tool_calls = std::mem::take(&mut self.tools)
            .into_values()
            .map(|tool| ToolCall {
                id: tool.id,
                name: tool.name,
                params: if tool.partial_json.trim().is_empty() {
                    tool.input.to_string()
                } else {
                    tool.partial_json
                },
            })
            .collect();
        FinalMessage {
            text: std::mem::take(&mut self.text),
            tool_calls,
        }
    }
}

struct EventDecoder {
    bytes: ByteStream,
    parser: StreamParser,
    assembler: MessageAssembler,
    pending: VecDeque<TransportEvent>,
    finished: bool,
}

impl EventDecoder {
    async fn next_event(&mut self) -> Option<Result<TransportEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }

            let chunk = match self.bytes.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return self.fail(err),
                None => {
                    return self.fail(anyhow!("stream ended before message_stop"));
                }
            };
            let events = match self.parser.process(&chunk) {
                Ok(events) => events,
                Err(err) => return self.fail(err),
            };
            for event in events {
                match self.assembler.handle(event, &mut self.pending) {
                    Ok(true) => {
                        self.finished = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(err) => return self.fail(err),
                }
            }
        }
    }

    fn fail(&mut self, err: anyhow::Error) -> Option<Result<TransportEvent>> {
        self.finished = true;
        self.pending.clear();
        Some(Err(err))
    }
}

/// Turns raw SSE bytes into the transport's event stream.
pub fn decode_events(bytes: ByteStream) -> impl Stream<Item = Result<TransportEvent>> + Send {
    let decoder = EventDecoder {
        bytes,
        parser: StreamParser::new(),
        assembler: MessageAssembler::default(),
        pending: VecDeque::new(),
        finished: false,
    };
    futures::stream::unfold(decoder, |mut decoder| async move {
        let item = decoder.next_event().await?;
        Some((item, decoder))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(event: &str, data: &str) -> String {
        format!("event: {event}\ndata: {data}\n\n")
    }

    fn byte_stream(chunks: Vec<String>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|chunk| Ok(Bytes::from(chunk))),
        ))
    }

    #[test]
    fn test_parser_buffers_split_events() {
        let mut parser = StreamParser::new();
        let event = sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        );
        let (head, tail) = event.split_at(20);
        assert!(parser.process(head.as_bytes()).unwrap().is_empty());
        let events = parser.process(tail.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn test_parser_keeps_split_utf8_intact() {
        let mut parser = StreamParser::new();
        let event = sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"é"}}"#,
        );
        let bytes = event.as_bytes();
        let split = event.find('é').unwrap() + 1;
        assert!(parser.process(&bytes[..split]).unwrap().is_empty());
        let events = parser.process(&bytes[split..]).unwrap();
        match &events[0] {
            StreamEvent::ContentBlockDelta { delta, .. } => {
                assert_eq!(delta.text.as_deref(), Some("é"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parser_skips_ping_and_unknown() {
        let mut parser = StreamParser::new();
        let mut input = sse("ping", r#"{"type":"ping"}"#);
        input.push_str(&sse("mystery", r#"{"type":"mystery"}"#));
        assert!(parser.process(input.as_bytes()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decode_assembles_text_and_tool_calls() {
        let chunks = vec![
            sse("message_start", r#"{"type":"message_start","message":{}}"#),
            sse(
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            sse(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Let me look."}}"#,
            ),
            sse(
                "content_block_start",
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"read_file","input":{}}}"#,
            ),
            sse(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
            ),
            sse(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"a.rs\"}"}}"#,
            ),
            sse("message_stop", r#"{"type":"message_stop"}"#),
        ];

        let events: Vec<_> = decode_events(byte_stream(chunks)).collect().await;
        let events: Vec<TransportEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            events,
            vec![
                TransportEvent::Text("Let me look.".into()),
                TransportEvent::Final(FinalMessage {
                    text: "Let me look.".into(),
                    tool_calls: vec![ToolCall {
                        id: "toolu_1".into(),
                        name: "read_file".into(),
                        params: r#"{"path":"a.rs"}"#.into(),
                    }],
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_reports_truncated_stream() {
        let chunks = vec![sse(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"par"}}"#,
        )];
        let mut stream = Box::pin(decode_events(byte_stream(chunks)));
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            TransportEvent::Text("par".into())
        );
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_decode_surfaces_error_events() {
        let chunks = vec![sse(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )];
        let mut stream = Box::pin(decode_events(byte_stream(chunks)));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Overloaded"));
    }
}
