use serde::{Deserialize, Serialize};

/// One message as the model transport sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ModelMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    Tool {
        id: String,
        name: String,
        params: String,
        content: String,
    },
}

impl ModelMessage {
    pub fn content(&self) -> &str {
        match self {
            ModelMessage::System { content }
            | ModelMessage::User { content }
            | ModelMessage::Assistant { content }
            | ModelMessage::Tool { content, .. } => content,
        }
    }
}

/// Catalog entry advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON parameters exactly as the model produced them.
    pub params: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalMessage {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Final(FinalMessage),
}
