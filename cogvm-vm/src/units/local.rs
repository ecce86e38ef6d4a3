//! Local tool unit
//!
//! File access, directory listing, shell execution and substring search on
//! the local machine, via tokio. Every outcome is a `{success, ...}` mapping;
//! I/O errors become `{success: false, error}`.

use super::{tool_failure, ToolKind, ToolUnit};
use serde_json::{json, Map, Value};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Upper bound on GREP matches per call
const MAX_MATCHES: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct LocalToolUnit {
    /// Relative paths resolve here; paths escaping it are refused
    root: Option<PathBuf>,
}

impl LocalToolUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confine every path to `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> std::result::Result<PathBuf, String> {
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(path));
        };
        let relative = Path::new(path);
        let escapes = relative.is_absolute()
            || relative.components().any(|c| matches!(c, Component::ParentDir));
        if escapes {
            return Err(format!("path '{}' is outside the tool root", path));
        }
        Ok(root.join(relative))
    }

    async fn read_file(&self, path: &str) -> Value {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return tool_failure(e),
        };
        match tokio::fs::read_to_string(&resolved).await {
            Ok(data) => json!({"success": true, "path": path, "data": data}),
            Err(e) => tool_failure(format!("{}: {}", path, e)),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Value {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return tool_failure(e),
        };
        if let Some(parent) = resolved.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return tool_failure(format!("{}: {}", parent.display(), e));
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(()) => json!({"success": true, "path": path, "bytes": content.len()}),
            Err(e) => tool_failure(format!("{}: {}", path, e)),
        }
    }

    async fn list_dir(&self, path: &str) -> Value {
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return tool_failure(e),
        };
        let mut entries = match tokio::fs::read_dir(&resolved).await {
            Ok(entries) => entries,
            Err(e) => return tool_failure(format!("{}: {}", path, e)),
        };

        let mut listed = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    listed.push(json!({
                        "name": entry.file_name().to_string_lossy(),
                        "is_dir": is_dir,
                    }));
                }
                Ok(None) => break,
                Err(e) => return tool_failure(format!("{}: {}", path, e)),
            }
        }
        listed.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        let count = listed.len();
        json!({"success": true, "path": path, "entries": listed, "count": count})
    }

    async fn exec(&self, command: &str) -> Value {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(root) = &self.root {
            cmd.current_dir(root);
        }
        match cmd.output().await {
            Ok(output) => json!({
                "success": output.status.success(),
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }),
            Err(e) => tool_failure(format!("failed to run '{}': {}", command, e)),
        }
    }

    async fn grep(&self, pattern: &str, path: &str) -> Value {
        if pattern.is_empty() {
            return tool_failure("pattern must not be empty");
        }
        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return tool_failure(e),
        };

        let mut matches = Vec::new();
        let mut pending = vec![resolved];
        while let Some(current) = pending.pop() {
            if matches.len() >= MAX_MATCHES {
                break;
            }
            let meta = match tokio::fs::metadata(&current).await {
                Ok(meta) => meta,
                Err(e) => return tool_failure(format!("{}: {}", current.display(), e)),
            };
            if meta.is_dir() {
                let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
                    continue;
                };
                let mut children = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    children.push(entry.path());
                }
                children.sort();
                pending.extend(children.into_iter().rev());
                continue;
            }
            // Binary or unreadable files are skipped
            let Ok(text) = tokio::fs::read_to_string(&current).await else {
                continue;
            };
            for (n, line) in text.lines().enumerate() {
                if line.contains(pattern) {
                    matches.push(json!({
                        "file": self.display_path(&current),
                        "line": n + 1,
                        "text": line,
                    }));
                    if matches.len() >= MAX_MATCHES {
                        break;
                    }
                }
            }
        }
        let count = matches.len();
        json!({"success": true, "matches": matches, "count": count})
    }

    fn display_path(&self, path: &Path) -> String {
        self.root
            .as_ref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> std::result::Result<&'a str, Value> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| tool_failure(format!("missing string argument '{}'", key)))
}

impl ToolUnit for LocalToolUnit {
    fn name(&self) -> &str {
        "local"
    }

    async fn invoke(&self, tool: ToolKind, args: Map<String, Value>) -> Value {
        let result = async {
            Ok::<Value, Value>(match tool {
                ToolKind::ReadFile => self.read_file(string_arg(&args, "path")?).await,
                ToolKind::WriteFile => {
                    self.write_file(string_arg(&args, "path")?, string_arg(&args, "content")?)
                        .await
                }
                ToolKind::ListDir => self.list_dir(string_arg(&args, "path")?).await,
                ToolKind::Exec => self.exec(string_arg(&args, "command")?).await,
                ToolKind::Grep => {
                    self.grep(string_arg(&args, "pattern")?, string_arg(&args, "path")?)
                        .await
                }
            })
        };
        result.await.unwrap_or_else(|failure| failure)
    }
}
