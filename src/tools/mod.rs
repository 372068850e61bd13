mod builtin;
mod registry;
mod workspace;

pub use builtin::{workspace_tools, EditFileTool, ListFilesTool, ReadFileTool, SearchFilesTool};
pub use registry::{Tool, ToolError, ToolRegistry};
pub use workspace::{SearchMatch, Workspace};
