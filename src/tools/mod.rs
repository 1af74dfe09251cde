//! Tool executor.
//!
//! Dispatches one [`ToolCall`] to the right implementation: the core trio
//! (`think`, `reply`, `wait_for`), a user script from `scripts/tools/`, or
//! the fixed host library. User scripts shadow host-library names, so an
//! agent can replace `bash` with its own version; the core trio cannot be
//! shadowed.
//!
//! All calls of one assistant turn run concurrently, but results come back
//! in call-declaration order so replay through the provider stays
//! deterministic. Tool failures never escalate: they become results whose
//! content starts with `ERROR: `.

pub mod builtins;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::jobs::JobRegistry;
use crate::models::{ToolCall, ToolDef};
use crate::scripts::ToolScript;

/// Wall-clock budget for one user-script execution.
pub const USER_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a tool dispatch needs; rebuilt each round so freshly loaded
/// user scripts take effect immediately.
pub struct ToolContext {
    pub workspace: PathBuf,
    pub jobs: Arc<JobRegistry>,
    pub user_tools: Vec<ToolScript>,
    /// Overridable in tests; [`USER_TOOL_TIMEOUT`] in production.
    pub tool_timeout: Duration,
}

impl ToolContext {
    pub fn new(workspace: PathBuf, jobs: Arc<JobRegistry>, user_tools: Vec<ToolScript>) -> Self {
        Self {
            workspace,
            jobs,
            user_tools,
            tool_timeout: USER_TOOL_TIMEOUT,
        }
    }

    /// All tool definitions for the provider call: core trio, user tools,
    /// and whatever host-library tools the user hasn't shadowed.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let mut defs = core_defs();
        for t in &self.user_tools {
            defs.push(t.def.clone());
        }
        for builtin in builtins::defs() {
            if !defs.iter().any(|d| d.name == builtin.name) {
                defs.push(builtin);
            }
        }
        defs
    }
}

/// Result of one executed tool call, ready to append to context.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
    pub wants_wait: bool,
}

/// Execute every call of an assistant turn concurrently, collecting
/// results in declaration order.
pub async fn execute_all(ctx: &Arc<ToolContext>, calls: &[ToolCall]) -> Vec<ToolResult> {
    let mut handles = Vec::with_capacity(calls.len());
    for call in calls {
        let ctx = Arc::clone(ctx);
        let call = call.clone();
        handles.push(tokio::spawn(async move { execute_one(&ctx, &call).await }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (handle, call) in handles.into_iter().zip(calls) {
        let result = match handle.await {
            Ok(r) => r,
            Err(e) => ToolResult {
                call_id: call.id.clone(),
                content: format!("ERROR: tool task panicked: {e}"),
                wants_wait: false,
            },
        };
        results.push(result);
    }
    results
}

/// Dispatch a single call. Never fails: failures become `ERROR: ` results.
pub async fn execute_one(ctx: &ToolContext, call: &ToolCall) -> ToolResult {
    debug!(tool = %call.name, id = %call.id, "executing tool call");
    let (content, wants_wait) = match call.name.as_str() {
        "think" => {
            let thought = call.args.get("thought").and_then(Value::as_str).unwrap_or("");
            info!(thought, "agent thought");
            ("OK".to_string(), false)
        }
        "reply" => match (
            call.args.get("source").and_then(Value::as_str),
            call.args.get("content").and_then(Value::as_str),
        ) {
            (Some(source), Some(content)) => {
                let metadata = call.args.get("metadata").cloned();
                match crate::router::deliver(&ctx.workspace, source, content, metadata).await {
                    Ok(dest) => (format!("Reply {dest}"), false),
                    Err(e) => (format!("ERROR: {e:#}"), false),
                }
            }
            _ => ("ERROR: reply requires `source` and `content`".to_string(), false),
        },
        "wait_for" => ("Waiting for new messages.".to_string(), true),
        name => {
            if let Some(script) = ctx.user_tools.iter().find(|t| t.def.name == name) {
                run_user_tool(ctx, script, call).await
            } else {
                run_host_tool(ctx, name, call).await
            }
        }
    };

    ToolResult {
        call_id: call.id.clone(),
        content,
        wants_wait,
    }
}

async fn run_user_tool(ctx: &ToolContext, script: &ToolScript, call: &ToolCall) -> (String, bool) {
    match tokio::time::timeout(ctx.tool_timeout, script.execute(&ctx.workspace, &call.args)).await {
        Ok(Ok(output)) => {
            let wants_wait = output.action.as_deref() == Some("wait");
            (output.result, wants_wait)
        }
        Ok(Err(e)) => {
            warn!(tool = %call.name, error = %e, "user tool failed");
            (format!("ERROR: {e:#}"), false)
        }
        Err(_) => {
            warn!(tool = %call.name, "user tool timed out");
            (
                format!(
                    "ERROR: Tool \"{}\" timed out after {}ms",
                    call.name,
                    ctx.tool_timeout.as_millis()
                ),
                false,
            )
        }
    }
}

async fn run_host_tool(ctx: &ToolContext, name: &str, call: &ToolCall) -> (String, bool) {
    let outcome = match name {
        "bash" => builtins::shell::bash(&ctx.jobs, &ctx.workspace, &call.args).await,
        "bash_kill" => builtins::shell::bash_kill(&ctx.jobs, &call.args).await,
        "read_file" => builtins::files::read_file(&ctx.workspace, &call.args)
            .await
            .map(|s| (s, false)),
        "write_file" => builtins::files::write_file(&ctx.workspace, &call.args)
            .await
            .map(|s| (s, false)),
        "list_files" => builtins::files::list_files(&ctx.workspace, &call.args)
            .await
            .map(|s| (s, false)),
        other => Err(anyhow::anyhow!("unknown tool \"{other}\"")),
    };
    match outcome {
        Ok(pair) => pair,
        Err(e) => (format!("ERROR: {e:#}"), false),
    }
}

/// Definitions of the core trio, always present and unshadowable.
pub fn core_defs() -> Vec<ToolDef> {
    use serde_json::json;
    vec![
        ToolDef {
            name: "think".into(),
            description: "Write down a private reasoning step. No side effects.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "thought": {"type": "string", "description": "The thought to record"}
                },
                "required": ["thought"]
            }),
        },
        ToolDef {
            name: "reply".into(),
            description: "Send a reply to a message source. Routed per routes.json, or queued \
                          in the outbox when no route matches."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "source": {"type": "string", "description": "The source to reply to, e.g. the [source] tag of the inbound message"},
                    "content": {"type": "string", "description": "Reply text"}
                },
                "required": ["source", "content"]
            }),
        },
        ToolDef {
            name: "wait_for".into(),
            description: "Finish this round and wait for new messages.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        },
    ]
}

// ── Tests ────────────────────────────────────────────────────
