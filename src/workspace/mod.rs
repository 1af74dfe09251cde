//! Workspace lifecycle: initialisation from role templates, inherited-state
//! reset, skill setup, boot/restart message injection, and the crash log.

pub mod templates;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde_json::{json, Value};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::comm::MessageQueue;
use crate::state::{self, AgentState};
use templates::{files_for_role, TemplateFile, BASE_FILES, BASE_SYSTEM_PROMPT, WORKER_PROMPT};

pub const ROLE_ROOT: &str = "root";
pub const ROLE_WORKER: &str = "worker";

/// Seed template files into the workspace, never overwriting existing ones.
async fn layer_files(workspace: &Path, files: &[TemplateFile]) -> anyhow::Result<()> {
    for file in files {
        let path = workspace.join(file.path);
        if path.exists() {
            debug!(path = %path.display(), "template file already present, keeping");
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, file.contents)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        if file.executable {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms)?;
        }
        debug!(path = %path.display(), "template file seeded");
    }
    Ok(())
}

/// Initialise a workspace for `role`: `_base` layer, role layer, then
/// `agent.json`. Re-running on an existing workspace only fills gaps.
pub async fn init(workspace: &Path, role: &str) -> anyhow::Result<()> {
    fs::create_dir_all(workspace)
        .await
        .with_context(|| format!("create workspace {}", workspace.display()))?;

    layer_files(workspace, BASE_FILES).await?;
    layer_files(workspace, files_for_role(role)).await?;

    if !workspace.join("agent.json").exists() {
        let provider = std::env::var("BURROW_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let agent = AgentState {
            provider,
            model: None,
            round: 0,
            max_rounds: None,
            system_prompt: BASE_SYSTEM_PROMPT.to_string(),
            role: Some(role.to_string()),
            extra: serde_json::Map::new(),
        };
        agent.save(workspace).await?;
        info!(role, workspace = %workspace.display(), "workspace initialised");
    }
    Ok(())
}

/// Detect a workspace inherited from a root agent and reset it to a clean
/// worker. Returns whether a reset happened.
///
/// Triggers when any of these hold: the context carries a `[system:boot]`
/// message, `agent.json.role` is `root`, or rounds were consumed while the
/// context is effectively empty.
pub async fn reset_inherited_root_state(workspace: &Path) -> anyhow::Result<bool> {
    let agent = match AgentState::load(workspace).await {
        Ok(a) => a,
        Err(_) => return Ok(false),
    };
    let ctx = state::load_context(workspace).await.unwrap_or_default();

    let has_boot_message = ctx.iter().any(|m| {
        m.content
            .as_deref()
            .map(|c| c.starts_with("[system:boot]"))
            .unwrap_or(false)
    });
    let inherited = has_boot_message
        || agent.role.as_deref() == Some(ROLE_ROOT)
        || (agent.round > 0 && ctx.is_empty());

    if !inherited {
        return Ok(false);
    }
    info!(
        boot_msg = has_boot_message,
        role = ?agent.role,
        round = agent.round,
        "inherited root state detected, resetting to worker"
    );

    state::save_context(workspace, &[]).await?;

    let mut agent = agent;
    agent.role = Some(ROLE_WORKER.to_string());
    agent.round = 0;
    agent.save(workspace).await?;

    fs::write(workspace.join("prompt.md"), WORKER_PROMPT)
        .await
        .context("write worker prompt.md")?;

    let skills = workspace.join("skills");
    if skills.exists() {
        fs::remove_dir_all(&skills).await.context("wipe skills dir")?;
    }
    layer_files(workspace, BASE_FILES).await?;
    layer_files(workspace, files_for_role(ROLE_WORKER)).await?;

    for round in state::list_rounds(workspace).await.unwrap_or_default() {
        let path = state::history_dir(workspace).join(format!("round-{round:05}.json"));
        let _ = fs::remove_file(&path).await;
    }

    Ok(true)
}

/// Run each skill's `setup.sh` (if present). Failures are logged, not fatal.
pub async fn run_skill_setups(workspace: &Path) {
    let skills_dir = workspace.join("skills");
    let mut rd = match fs::read_dir(&skills_dir).await {
        Ok(rd) => rd,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = rd.next_entry().await {
        let skill_dir = entry.path();
        let setup = skill_dir.join("setup.sh");
        if !setup.exists() {
            continue;
        }
        let skill = entry.file_name().to_string_lossy().to_string();
        info!(skill, "running skill setup");
        match tokio::process::Command::new("sh")
            .arg(&setup)
            .current_dir(&skill_dir)
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                debug!(skill, "skill setup completed");
            }
            Ok(out) => {
                warn!(
                    skill,
                    status = %out.status,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "skill setup failed"
                );
            }
            Err(e) => warn!(skill, error = %e, "skill setup could not run"),
        }
    }
}

/// Inject the synthetic boot (root) or restart (resumed worker) message.
pub async fn inject_boot_message(workspace: &Path, queue: &Arc<MessageQueue>, is_root: bool) {
    if is_root {
        queue.push(
            "You are booting as the root agent. Spawn a worker agent now (see the \
             spawn-worker skill) and supervise it. Report readiness via reply once \
             the worker is up.",
            "system:boot",
            None,
        );
        return;
    }

    let ctx = state::load_context(workspace).await.unwrap_or_default();
    if ctx.is_empty() {
        return;
    }
    let mut content = String::from(
        "The agent process restarted. Your context above is the state from before \
         the restart; review it and resume whatever was in progress.",
    );
    if let Some(crash) = last_crash(workspace).await {
        content.push_str(&format!("\nLast crash record: {crash}"));
    }
    queue.push(content, "system:restart", None);
}

// ── Crash log ────────────────────────────────────────────────

/// Append a crash record to `crash.log` (one JSON object per line).
///
/// Synchronous on purpose: it must work from a panic hook and during
/// shutdown, where no runtime may be available.
pub fn append_crash(workspace: &Path, source: &str, message: &str, stack: &str) {
    let line = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "source": source,
        "message": message,
        "stack": stack,
        "pid": std::process::id(),
        "workspace": workspace.display().to_string(),
    });
    let path = workspace.join("crash.log");
    use std::io::Write as _;
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(f, "{line}");
    }
}

/// Last entry of `crash.log`, if any.
pub async fn last_crash(workspace: &Path) -> Option<Value> {
    let raw = fs::read_to_string(workspace.join("crash.log")).await.ok()?;
    raw.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str(l).ok())
}

// ── Tests ────────────────────────────────────────────────────
