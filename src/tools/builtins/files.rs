//! File tools: `read_file`, `write_file`, `list_files`.
//!
//! Relative paths resolve against the workspace; absolute paths are allowed
//! — the workspace owner runs with full process privileges, and the agent
//! routinely edits its own `agent.json` and `scripts/` through these.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde_json::{json, Value};

use crate::models::ToolDef;

fn resolve(workspace: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace.join(p)
    }
}

pub async fn read_file(workspace: &Path, args: &Value) -> anyhow::Result<String> {
    let raw = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("read_file requires `path`"))?;
    let path = resolve(workspace, raw);
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("read {}", path.display()))
}

pub async fn write_file(workspace: &Path, args: &Value) -> anyhow::Result<String> {
    let raw = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("write_file requires `path`"))?;
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("write_file requires `content`"))?;
    let path = resolve(workspace, raw);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(format!("Wrote {} bytes to {}", content.len(), path.display()))
}

pub async fn list_files(workspace: &Path, args: &Value) -> anyhow::Result<String> {
    let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
    let path = resolve(workspace, raw);
    let mut rd = tokio::fs::read_dir(&path)
        .await
        .with_context(|| format!("list {}", path.display()))?;
    let mut names = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    Ok(names.join("\n"))
}

pub fn defs() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "read_file".into(),
            description: "Read a file and return its contents. Relative paths resolve against the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path to read"}
                },
                "required": ["path"]
            }),
        },
        ToolDef {
            name: "write_file".into(),
            description: "Write content to a file, creating parent directories as needed.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path to write"},
                    "content": {"type": "string", "description": "Full file content"}
                },
                "required": ["path", "content"]
            }),
        },
        ToolDef {
            name: "list_files".into(),
            description: "List directory entries. Defaults to the workspace root.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory to list (default: .)"}
                }
            }),
        },
    ]
}
