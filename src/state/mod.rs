//! Workspace state store.
//!
//! Every piece of durable agent state lives as a JSON file under the
//! workspace root; this module owns the schemas and the read/write helpers.
//! All helpers are stateless async fns over a `workspace: &Path`, and a
//! missing file reads as empty so a fresh workspace needs no priming.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::models::{ChatOutcome, Message};

// ── agent.json ───────────────────────────────────────────────

/// The agent's own configuration record.
///
/// `extra` captures any fields the agent writes into `agent.json` beyond the
/// known schema, so a round-counter bump never destroys a self-edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    /// Provider spec filename stem under `scripts/providers/`.
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Completed-round counter; monotonically non-decreasing.
    #[serde(default)]
    pub round: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u64>,
    /// Base system prompt (role-free; the role fragment lives in prompt.md).
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl AgentState {
    pub async fn load(workspace: &Path) -> anyhow::Result<Self> {
        let path = workspace.join("agent.json");
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
    }

    pub async fn save(&self, workspace: &Path) -> anyhow::Result<()> {
        let path = workspace.join("agent.json");
        let raw = serde_json::to_string_pretty(self).context("serialize agent.json")?;
        fs::write(&path, raw)
            .await
            .with_context(|| format!("write {}", path.display()))
    }
}

/// Re-read `agent.json`, bump only the round counter, and write it back.
///
/// Everything except `round` is treated as externally authoritative so the
/// agent may rewrite its own provider/model/prompt mid-round.
pub async fn bump_round(workspace: &Path) -> anyhow::Result<AgentState> {
    let mut state = AgentState::load(workspace).await?;
    state.round += 1;
    state.save(workspace).await?;
    Ok(state)
}

// ── memory/context.json ──────────────────────────────────────

pub fn context_path(workspace: &Path) -> PathBuf {
    workspace.join("memory").join("context.json")
}

/// Load the persisted conversation context; missing file reads as empty.
pub async fn load_context(workspace: &Path) -> anyhow::Result<Vec<Message>> {
    let path = context_path(workspace);
    match fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

pub async fn save_context(workspace: &Path, context: &[Message]) -> anyhow::Result<()> {
    let path = context_path(workspace);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.context("create memory dir")?;
    }
    let raw = serde_json::to_string_pretty(context).context("serialize context")?;
    fs::write(&path, raw)
        .await
        .with_context(|| format!("write {}", path.display()))
}

/// Append a compaction summary block to `memory/summary.md`.
pub async fn append_summary(workspace: &Path, summary: &str) -> anyhow::Result<()> {
    let dir = workspace.join("memory");
    fs::create_dir_all(&dir).await.context("create memory dir")?;
    let path = dir.join("summary.md");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(summary.as_bytes()).await?;
    file.write_all(b"\n\n").await?;
    Ok(())
}

// ── routes.json ──────────────────────────────────────────────

/// One outbound delivery endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub url: String,
}

/// Load the source-prefix routing table; missing file reads as empty.
pub async fn load_routes(workspace: &Path) -> anyhow::Result<HashMap<String, Route>> {
    let path = workspace.join("routes.json");
    match fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

// ── history/round-NNNNN.json ─────────────────────────────────

/// Record of one completed round: only the messages that round produced,
/// never the full context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    pub round: u64,
    /// Unix-epoch milliseconds.
    pub timestamp: u64,
    pub messages: Vec<Message>,
    pub response: ChatOutcome,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

pub fn history_dir(workspace: &Path) -> PathBuf {
    workspace.join("history")
}

fn round_path(workspace: &Path, round: u64) -> PathBuf {
    history_dir(workspace).join(format!("round-{round:05}.json"))
}

pub async fn save_round(workspace: &Path, record: &RoundRecord) -> anyhow::Result<()> {
    let dir = history_dir(workspace);
    fs::create_dir_all(&dir).await.context("create history dir")?;
    let path = round_path(workspace, record.round);
    let raw = serde_json::to_string_pretty(record).context("serialize round record")?;
    fs::write(&path, raw)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    debug!(round = record.round, "round record persisted");
    Ok(())
}

pub async fn load_round(workspace: &Path, round: u64) -> anyhow::Result<Option<RoundRecord>> {
    let path = round_path(workspace, round);
    match fs::read_to_string(&path).await {
        Ok(raw) => Ok(Some(
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

/// List completed round numbers, ascending.
pub async fn list_rounds(workspace: &Path) -> anyhow::Result<Vec<u64>> {
    let dir = history_dir(workspace);
    let mut rounds = Vec::new();
    let mut rd = match fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(rounds),
        Err(e) => return Err(e).context("read history dir"),
    };
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(num) = name
            .strip_prefix("round-")
            .and_then(|s| s.strip_suffix(".json"))
        {
            if let Ok(n) = num.parse::<u64>() {
                rounds.push(n);
            }
        }
    }
    rounds.sort_unstable();
    Ok(rounds)
}

// ── outbox/<uuid>.json ───────────────────────────────────────

/// A reply that had no matching route, awaiting external pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: String,
    pub source: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Unix-epoch milliseconds.
    pub timestamp: u64,
}

pub fn outbox_dir(workspace: &Path) -> PathBuf {
    workspace.join("outbox")
}

pub async fn write_outbox(workspace: &Path, msg: &OutboxMessage) -> anyhow::Result<()> {
    let dir = outbox_dir(workspace);
    fs::create_dir_all(&dir).await.context("create outbox dir")?;
    let path = dir.join(format!("{}.json", msg.id));
    let raw = serde_json::to_string_pretty(msg).context("serialize outbox message")?;
    fs::write(&path, raw)
        .await
        .with_context(|| format!("write {}", path.display()))
}

/// List all pending outbox messages, oldest first.
pub async fn list_outbox(workspace: &Path) -> anyhow::Result<Vec<OutboxMessage>> {
    let dir = outbox_dir(workspace);
    let mut messages = Vec::new();
    let mut rd = match fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(messages),
        Err(e) => return Err(e).context("read outbox dir"),
    };
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<OutboxMessage>(&raw) {
                Ok(msg) => messages.push(msg),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping malformed outbox file"),
            },
            Err(_) => continue,
        }
    }
    messages.sort_by_key(|m| m.timestamp);
    Ok(messages)
}

/// Delete one outbox entry; returns `false` when no such id exists.
pub async fn delete_outbox(workspace: &Path, id: &str) -> anyhow::Result<bool> {
    let path = outbox_dir(workspace).join(format!("{id}.json"));
    match fs::remove_file(&path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

// ── Tests ────────────────────────────────────────────────────
