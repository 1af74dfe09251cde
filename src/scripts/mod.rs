//! Script loader.
//!
//! User-editable behaviour lives under `scripts/` in the workspace:
//!
//! - `scripts/providers/<name>.json` — a declarative spec for an
//!   OpenAI-compatible chat endpoint, materialised into an
//!   [`HttpProvider`](crate::models::HttpProvider) on every load.
//! - `scripts/tools/*` — executable tool scripts speaking a small stdio
//!   protocol: `<script> describe` prints a manifest
//!   (`{name, description, parameters}`, name defaulting to the file stem)
//!   and `<script> execute` reads the args JSON on stdin and prints
//!   `{result, action?}` (or plain text, taken as the result).
//!
//! Every load re-reads the files, so edits made by the agent itself take
//! effect on the next round. [`probe`] loads the active provider and all
//! tools and surfaces the first failure; the repair path uses it to decide
//! whether the scripts are healthy again.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::models::{HttpProvider, Provider, ToolDef};

/// Wall-clock budget for a `describe` handshake.
const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Provider specs ───────────────────────────────────────────

/// On-disk shape of `scripts/providers/<name>.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Chat-completions URL.
    pub endpoint: String,
    /// Environment variable holding the API key; empty/missing means no auth.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Default model; `agent.json.model` overrides it.
    #[serde(default)]
    pub model: Option<String>,
    /// Extra request headers.
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

pub fn providers_dir(workspace: &Path) -> PathBuf {
    workspace.join("scripts").join("providers")
}

pub fn tools_dir(workspace: &Path) -> PathBuf {
    workspace.join("scripts").join("tools")
}

/// Load the provider spec named by `agent.json.provider` and build a live
/// provider from it. `model_override` is the agent-level model, if set.
pub async fn load_provider(
    workspace: &Path,
    name: &str,
    model_override: Option<&str>,
) -> anyhow::Result<Box<dyn Provider>> {
    let path = providers_dir(workspace).join(format!("{name}.json"));
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("read provider spec {}", path.display()))?;
    let spec: ProviderSpec = serde_json::from_str(&raw)
        .with_context(|| format!("parse provider spec {}", path.display()))?;

    let api_key = spec
        .api_key_env
        .as_deref()
        .filter(|v| !v.is_empty())
        .and_then(|var| std::env::var(var).ok())
        .unwrap_or_default();

    let model = model_override
        .map(String::from)
        .or_else(|| spec.model.clone());

    let headers: Vec<(String, String)> = spec.headers.into_iter().collect();
    debug!(provider = name, endpoint = %spec.endpoint, "provider spec loaded");
    Ok(Box::new(HttpProvider::new(spec.endpoint, api_key, model, headers)))
}

// ── Tool scripts ─────────────────────────────────────────────

/// A user tool loaded from `scripts/tools/`.
#[derive(Debug, Clone)]
pub struct ToolScript {
    pub def: ToolDef,
    pub path: PathBuf,
}

/// Output of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: String,
    /// `Some("wait")` requests wait state after the round.
    pub action: Option<String>,
}

/// Manifest printed by `<script> describe`. All fields optional; the file
/// stem backfills the name.
#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
}

/// Load every tool script in `scripts/tools/`, fresh from disk.
///
/// A script whose `describe` handshake fails (spawn error, non-zero exit,
/// malformed manifest) fails the whole load — that is the `script_load`
/// error the repair protocol watches for.
pub async fn load_tools(workspace: &Path) -> anyhow::Result<Vec<ToolScript>> {
    let dir = tools_dir(workspace);
    let mut scripts = Vec::new();

    let mut rd = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scripts),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };

    let mut paths = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.file_type().await?.is_file() {
            continue;
        }
        paths.push(path);
    }
    paths.sort();

    for path in paths {
        let script = describe_tool(workspace, &path)
            .await
            .with_context(|| format!("load tool script {}", path.display()))?;
        scripts.push(script);
    }

    debug!(count = scripts.len(), "tool scripts loaded");
    Ok(scripts)
}

async fn describe_tool(workspace: &Path, path: &Path) -> anyhow::Result<ToolScript> {
    let output = tokio::time::timeout(
        DESCRIBE_TIMEOUT,
        Command::new(path)
            .arg("describe")
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("describe timed out after {}s", DESCRIBE_TIMEOUT.as_secs()))?
    .context("spawn describe")?;

    if !output.status.success() {
        anyhow::bail!(
            "describe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let manifest: Manifest = if stdout.trim().is_empty() {
        Manifest::default()
    } else {
        serde_json::from_str(stdout.trim()).context("parse describe manifest")?
    };

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(ToolScript {
        def: ToolDef {
            name: manifest.name.unwrap_or(stem),
            description: manifest.description.unwrap_or_default(),
            parameters: manifest
                .parameters
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
        },
        path: path.to_path_buf(),
    })
}

impl ToolScript {
    /// Run the script's `execute` phase with `args` on stdin.
    ///
    /// The caller bounds this with the tool wall-clock timeout; here we only
    /// report spawn/exit failures.
    pub async fn execute(&self, workspace: &Path, args: &Value) -> anyhow::Result<ToolOutput> {
        let mut child = Command::new(&self.path)
            .arg("execute")
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", self.path.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(args.to_string().as_bytes())
                .await
                .context("write tool args")?;
            // Close stdin so scripts that read to EOF don't hang.
            drop(stdin);
        }

        let output = child.wait_with_output().await.context("wait for tool")?;
        if !output.status.success() {
            anyhow::bail!(
                "tool exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // Structured output is preferred; plain text is taken as the result.
        if let Ok(parsed) = serde_json::from_str::<Value>(&stdout) {
            if let Some(obj) = parsed.as_object() {
                if obj.contains_key("result") {
                    let result = match &obj["result"] {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let action = obj.get("action").and_then(Value::as_str).map(String::from);
                    return Ok(ToolOutput { result, action });
                }
            }
        }
        Ok(ToolOutput {
            result: stdout,
            action: None,
        })
    }
}

// ── Probe ────────────────────────────────────────────────────

/// Load the active provider and every tool, surfacing the first failure.
pub async fn probe(workspace: &Path, provider: &str) -> anyhow::Result<()> {
    load_provider(workspace, provider, None).await?;
    load_tools(workspace).await?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────
