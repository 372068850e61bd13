use super::registry::{run_blocking, Tool, ToolRegistry};
use super::workspace::Workspace;
use crate::parser::{
    apply_search_replace_blocks, extract_search_replace_blocks, BlockState, DIVIDER, FINAL,
    ORIGINAL,
};
use anyhow::{bail, Context};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_ENTRIES: usize = 200;
const DEFAULT_MAX_RESULTS: usize = 50;

/// The read-only workspace tools plus `edit_file`.
pub fn workspace_tools(workspace: Arc<Workspace>, timeout: Duration) -> ToolRegistry {
    ToolRegistry::new(timeout)
        .with(ReadFileTool(Arc::clone(&workspace)))
        .with(ListFilesTool(Arc::clone(&workspace)))
        .with(SearchFilesTool(Arc::clone(&workspace)))
        .with(EditFileTool(workspace))
}

fn parse_params<T: DeserializeOwned>(tool: &str, params: &str) -> anyhow::Result<T> {
    let params = if params.trim().is_empty() { "{}" } else { params };
    serde_json::from_str(params).with_context(|| format!("invalid parameters for {tool}"))
}

fn required_str<'a>(result: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    result
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("result is missing '{key}'"))
}

#[derive(Deserialize)]
struct PathParams {
    #[serde(alias = "file_path", alias = "file")]
    path: String,
}

pub struct ReadFileTool(pub Arc<Workspace>);

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the full text of a workspace file."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    fn call(&self, params: &str) -> BoxFuture<'static, anyhow::Result<Value>> {
        let workspace = Arc::clone(&self.0);
        let params = parse_params::<PathParams>(self.name(), params);
        Box::pin(async move {
            let PathParams { path } = params?;
            run_blocking("read_file", move || {
                let content = workspace.read_file(&path)?;
                Ok(json!({ "path": path, "content": content }))
            })
            .await
        })
    }

    fn result_to_string(&self, result: &Value) -> anyhow::Result<String> {
        Ok(required_str(result, "content")?.to_string())
    }
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default, alias = "dir")]
    path: Option<String>,
    #[serde(default)]
    max_entries: Option<usize>,
}

pub struct ListFilesTool(pub Arc<Workspace>);

impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories under a workspace path."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "max_entries": { "type": "integer", "minimum": 1, "maximum": 2000 }
            }
        })
    }

    fn call(&self, params: &str) -> BoxFuture<'static, anyhow::Result<Value>> {
        let workspace = Arc::clone(&self.0);
        let params = parse_params::<ListParams>(self.name(), params);
        Box::pin(async move {
            let params = params?;
            run_blocking("list_files", move || {
                let entries = workspace.list_files(
                    params.path.as_deref(),
                    params.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
                )?;
                Ok(json!({ "entries": entries }))
            })
            .await
        })
    }

    fn result_to_string(&self, result: &Value) -> anyhow::Result<String> {
        let entries: Vec<String> = serde_json::from_value(
            result.get("entries").cloned().unwrap_or(Value::Null),
        )
        .context("result is missing 'entries'")?;
        if entries.is_empty() {
            Ok("(no files found)".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(alias = "pattern")]
    query: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

pub struct SearchFilesTool(pub Arc<Workspace>);

impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search text across workspace files and return matching lines."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "path": { "type": "string" },
                "max_results": { "type": "integer", "minimum": 1, "maximum": 200 }
            },
            "required": ["query"]
        })
    }

    fn call(&self, params: &str) -> BoxFuture<'static, anyhow::Result<Value>> {
        let workspace = Arc::clone(&self.0);
        let params = parse_params::<SearchParams>(self.name(), params);
        Box::pin(async move {
            let params = params?;
            run_blocking("search_files", move || {
                let matches = workspace.search(
                    &params.query,
                    params.path.as_deref(),
                    params.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
                )?;
                Ok(json!({ "matches": matches }))
            })
            .await
        })
    }

    fn result_to_string(&self, result: &Value) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct Match {
            path: String,
            line: usize,
            text: String,
        }
        let matches: Vec<Match> = serde_json::from_value(
            result.get("matches").cloned().unwrap_or(Value::Null),
        )
        .context("result is missing 'matches'")?;
        if matches.is_empty() {
            return Ok("No matches found.".to_string());
        }
        Ok(matches
            .iter()
            .map(|m| format!("{}:{}:{}", m.path, m.line, m.text))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[derive(Deserialize)]
struct EditParams {
    #[serde(alias = "file_path", alias = "file")]
    path: String,
    #[serde(alias = "edits", alias = "diff")]
    blocks: String,
}

/// Applies search/replace blocks to one file. A missing file is treated as
/// empty, so a single block with an empty original creates it.
pub struct EditFileTool(pub Arc<Workspace>);

impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a workspace file with search/replace blocks. Each block is\n\
         <<<<<<< ORIGINAL\\n<exact text>\\n=======\\n<replacement>\\n>>>>>>> UPDATED\n\
         and each original must match exactly once."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "blocks": {
                    "type": "string",
                    "description": format!("One or more {ORIGINAL} / {DIVIDER} / {FINAL} blocks")
                }
            },
            "required": ["path", "blocks"]
        })
    }

    fn call(&self, params: &str) -> BoxFuture<'static, anyhow::Result<Value>> {
        let workspace = Arc::clone(&self.0);
        let params = parse_params::<EditParams>(self.name(), params);
        Box::pin(async move {
            let EditParams { path, blocks } = params?;
            run_blocking("edit_file", move || {
                let blocks = extract_search_replace_blocks(&blocks);
                if blocks.iter().any(|block| block.state != BlockState::Done) {
                    bail!("edit_file received an unterminated search/replace block");
                }
                let resolved = workspace.resolve_path(&path)?;
                let source = if resolved.exists() {
                    workspace.read_file(&path)?
                } else {
                    String::new()
                };
                let updated = apply_search_replace_blocks(&source, &blocks)?;
                workspace.write_file(&path, &updated)?;
                Ok(json!({ "path": path, "applied": blocks.len() }))
            })
            .await
        })
    }

    fn result_to_string(&self, result: &Value) -> anyhow::Result<String> {
        let path = required_str(result, "path")?;
        let applied = result
            .get("applied")
            .and_then(Value::as_u64)
            .context("result is missing 'applied'")?;
        let noun = if applied == 1 { "edit" } else { "edits" };
        Ok(format!("Applied {applied} {noun} to {path}."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry() -> (TempDir, ToolRegistry) {
        let temp = TempDir::new().expect("temp dir");
        let workspace = Arc::new(Workspace::new(temp.path().to_path_buf()));
        (temp, workspace_tools(workspace, Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn test_read_file_accepts_path_aliases() {
        let (temp, registry) = registry();
        fs::write(temp.path().join("notes.md"), "hello").unwrap();

        let value = registry
            .call("read_file", r#"{"file_path":"notes.md"}"#)
            .await
            .unwrap();
        assert_eq!(
            registry.result_to_string("read_file", &value).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn test_search_files_renders_matches() {
        let (temp, registry) = registry();
        fs::write(temp.path().join("a.rs"), "let needle = 1;\n").unwrap();

        let value = registry
            .call("search_files", r#"{"query":"needle"}"#)
            .await
            .unwrap();
        assert_eq!(
            registry.result_to_string("search_files", &value).unwrap(),
            "a.rs:1:let needle = 1;"
        );
        let empty = json!({ "matches": [] });
        assert_eq!(
            registry.result_to_string("search_files", &empty).unwrap(),
            "No matches found."
        );
    }

    #[tokio::test]
    async fn test_edit_file_applies_blocks() {
        let (temp, registry) = registry();
        fs::write(temp.path().join("main.rs"), "fn main() {\n    old();\n}\n").unwrap();

        let blocks = format!("{ORIGINAL}\n    old();\n{DIVIDER}\n    new();\n{FINAL}\n");
        let params = json!({ "path": "main.rs", "blocks": blocks }).to_string();
        let value = registry.call("edit_file", &params).await.unwrap();

        assert_eq!(
            fs::read_to_string(temp.path().join("main.rs")).unwrap(),
            "fn main() {\n    new();\n}\n"
        );
        assert_eq!(
            registry.result_to_string("edit_file", &value).unwrap(),
            "Applied 1 edit to main.rs."
        );
    }

    #[tokio::test]
    async fn test_edit_file_rejects_missing_original_and_traversal() {
        let (temp, registry) = registry();
        fs::write(temp.path().join("main.rs"), "fn main() {}\n").unwrap();

        let blocks = format!("{ORIGINAL}\nnope\n{DIVIDER}\nyes\n{FINAL}\n");
        let params = json!({ "path": "main.rs", "blocks": blocks }).to_string();
        assert!(registry.call("edit_file", &params).await.is_err());

        let params = json!({ "path": "../escape.rs", "blocks": blocks }).to_string();
        assert!(registry.call("edit_file", &params).await.is_err());
    }

    #[test]
    fn test_catalog_lists_builtin_tools() {
        let (_temp, registry) = registry();
        let names: Vec<String> = registry.catalog().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["edit_file", "list_files", "read_file", "search_files"]
        );
    }
}
