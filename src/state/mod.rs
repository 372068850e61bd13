pub mod migration;
mod stream_state;
mod thread_store;

pub use stream_state::{RequestId, StreamError, StreamStateTracker, ThreadStreamState};
pub use thread_store::{StoreError, ThreadStatePatch, ThreadStore, UserMessageStatePatch};
