//! Conversational agent orchestration: persisted chat threads, a streaming
//! model loop with sequential tool execution, and incremental parsing of
//! code edits out of partially received model output.

pub mod agent;
pub mod api;
pub mod config;
pub mod events;
pub mod logging;
pub mod parser;
pub mod state;
pub mod storage;
pub mod tools;
pub mod types;
pub mod util;

#[cfg(test)]
mod test_support;
