mod client;
mod mock_client;
pub mod stream;
mod transport;

pub use client::{to_api_messages, AnthropicTransport};
pub use mock_client::{ScriptStep, ScriptedResponse, ScriptedTransport};
pub use transport::{ModelRequest, ModelTransport, TransportError, TransportStream};
