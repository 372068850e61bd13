use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Filesystem access confined to one working directory.
///
/// Paths are workspace relative; absolute paths, `..` components and
/// symlinks that leave the workspace are rejected.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    canonical_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

impl Workspace {
    pub fn new(root: PathBuf) -> Self {
        let canonical_root = fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self {
            root,
            canonical_root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        if path.starts_with('/') || path.contains('\\') {
            bail!("Security error: absolute or platform-specific path not allowed: {path}");
        }

        let relative_path = Path::new(path);
        if relative_path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            bail!("Security error: path traversal detected: {path}");
        }

        let normalized = normalize_path(&self.root.join(relative_path));
        self.ensure_within_workspace(&normalized)?;
        Ok(normalized)
    }

    /// Accepts `file://` URIs and absolute paths that point inside the
    /// workspace, as attached selections carry them.
    pub fn resolve_uri(&self, uri: &str) -> Result<PathBuf> {
        let raw = uri.strip_prefix("file://").unwrap_or(uri);
        let path = Path::new(raw);
        if !path.is_absolute() {
            return self.resolve_path(raw);
        }
        let relative = path
            .strip_prefix(&self.root)
            .or_else(|_| path.strip_prefix(&self.canonical_root))
            .with_context(|| format!("Security error: {uri} is outside the workspace"))?;
        self.resolve_path(&relative.to_string_lossy())
    }

    fn ensure_within_workspace(&self, path: &Path) -> Result<()> {
        let guard_path = nearest_existing_ancestor(path)
            .context("Security error: could not find an existing parent path")?;
        let canonical_guard = fs::canonicalize(guard_path)
            .with_context(|| format!("Failed to canonicalize {}", guard_path.display()))?;
        if !canonical_guard.starts_with(&self.canonical_root) {
            bail!(
                "Security error: path escapes working directory via symlink or traversal: {}",
                path.display()
            );
        }
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path)?;
        fs::read_to_string(&resolved).with_context(|| format!("Failed to read {path}"))
    }

    pub fn read_uri(&self, uri: &str) -> Result<String> {
        let resolved = self.resolve_uri(uri)?;
        fs::read_to_string(&resolved).with_context(|| format!("Failed to read {uri}"))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let resolved = self.resolve_path(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(resolved, content).with_context(|| format!("Failed to write {path}"))
    }

    pub fn list_files(&self, path: Option<&str>, max_entries: usize) -> Result<Vec<String>> {
        let root = self.resolve_optional_path(path)?;
        let limit = max_entries.clamp(1, 2000);

        if root.is_file() {
            return Ok(vec![self.relative_display(&root)]);
        }

        let mut entries = Vec::new();
        for child in sorted_children(&root)? {
            let name = child.file_name();
            if self.should_skip(&root, &name.to_string_lossy()) {
                continue;
            }
            let path = child.path();
            let mut display = self.relative_display(&path);
            if path.is_dir() {
                display.push('/');
            }
            entries.push(display);
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }

    /// Case-insensitive unless `query` contains an uppercase character.
    pub fn search(
        &self,
        query: &str,
        path: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<SearchMatch>> {
        let query = non_empty_trimmed(query).context("search requires a non-empty query")?;
        let root = self.resolve_optional_path(path)?;
        let max_results = max_results.clamp(1, 200);
        let case_sensitive = query.chars().any(char::is_uppercase);
        let lowered_query = query.to_lowercase();

        let mut results = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(path) = stack.pop() {
            if path.is_dir() {
                let children = sorted_children(&path)?;
                for child in children.into_iter().rev() {
                    if !self.should_skip(&path, &child.file_name().to_string_lossy()) {
                        stack.push(child.path());
                    }
                }
                continue;
            }

            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                let is_match = if case_sensitive {
                    line.contains(query)
                } else {
                    line.to_lowercase().contains(&lowered_query)
                };
                if is_match {
                    results.push(SearchMatch {
                        path: self.relative_display(&path),
                        line: idx + 1,
                        text: line.to_string(),
                    });
                    if results.len() >= max_results {
                        return Ok(results);
                    }
                }
            }
        }
        Ok(results)
    }

    fn resolve_optional_path(&self, path: Option<&str>) -> Result<PathBuf> {
        match path.and_then(non_empty_trimmed) {
            None | Some(".") => Ok(self.root.clone()),
            Some(value) => self.resolve_path(value),
        }
    }

    fn relative_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|relative| relative.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string_lossy().to_string())
    }

    fn should_skip(&self, parent: &Path, name: &str) -> bool {
        if name.starts_with('.') {
            return true;
        }
        parent == self.root
            && matches!(
                name,
                "target" | "node_modules" | "__pycache__" | "venv" | "build" | "dist"
            )
    }
}

fn sorted_children(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut children = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to list entries in {}", dir.display()))?;
    children.sort_by_key(|entry| entry.path());
    Ok(children)
}

fn nearest_existing_ancestor(path: &Path) -> Option<&Path> {
    let mut current = path;
    while !current.exists() {
        current = current.parent()?;
    }
    Some(current)
}

fn normalize_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

fn non_empty_trimmed(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
