//! The per-turn agent loop.

pub mod prompt;
mod service;

pub use service::{ChatError, ChatOptions, ChatThreadService, TurnHandle};
