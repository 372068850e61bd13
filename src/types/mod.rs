pub mod api;
mod model;
mod thread;

pub use model::{FinalMessage, ModelMessage, ToolCall, ToolSpec, TransportEvent};
pub use thread::{
    ChatMessage, ChatThread, Selection, TextRange, ThreadId, ThreadMap, ThreadState,
    ThreadsState, UserMessageState,
};
