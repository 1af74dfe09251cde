//! Agent runtime: the per-round executor loop and its error/repair
//! state machine.
//!
//! One [`Agent`] owns one workspace. [`Agent::run`] blocks on the message
//! queue and turns each batch of inbound messages into rounds:
//! load state → reload scripts → drain queue → prune/compact → call the
//! provider → execute tool calls in parallel → persist context and history
//! → bump the round counter → wait or continue.
//!
//! Failures that a single tool can absorb never leave the round; everything
//! else (`script_load`, `llm_call`, `unknown`) parks the loop in the error
//! state, where the repair protocol polls for a `.repair-signal` file or a
//! healthy script probe before resuming. A repair timeout is fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::comm::MessageQueue;
use crate::context;
use crate::jobs::JobRegistry;
use crate::models::{chat_with_retry, Message, Provider};
use crate::scripts::{self, ToolScript};
use crate::state::{self, AgentState, RoundRecord};
use crate::tools::{self, ToolContext};
use crate::utils::now_ms;

/// Error-state poll cadence.
pub const REPAIR_POLL: Duration = Duration::from_secs(15);
/// Total repair budget; exceeding it is fatal.
pub const REPAIR_TIMEOUT: Duration = Duration::from_secs(600);
/// Consecutive tool-less turns tolerated before forcing wait state.
const MAX_EMPTY_TURNS: u32 = 3;

const NUDGE_MESSAGE: &str = "[system:nudge] Your last reply contained no tool calls. \
Act through tools: use `reply` to answer a source, or `wait_for` to pause until new \
messages arrive.";

// ── Status ───────────────────────────────────────────────────

/// Loop state as exposed on `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Waiting,
    Running,
    Error,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Waiting => "waiting",
            RunState::Running => "running",
            RunState::Error => "error",
        }
    }
}

/// Details of the failure that parked the loop.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub source: String,
    pub message: String,
    pub stack: String,
    pub timestamp: u64,
}

/// Shared between the executor and the HTTP surface.
#[derive(Debug)]
pub struct Status {
    pub state: RunState,
    pub error: Option<ErrorRecord>,
}

pub type SharedStatus = Arc<RwLock<Status>>;

pub fn new_status() -> SharedStatus {
    Arc::new(RwLock::new(Status {
        state: RunState::Waiting,
        error: None,
    }))
}

// ── Round errors ─────────────────────────────────────────────

/// The only failure categories the core distinguishes (`tool` failures are
/// absorbed into tool results and never reach here).
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("script load failed: {0:#}")]
    ScriptLoad(anyhow::Error),
    #[error("provider call failed: {0:#}")]
    LlmCall(anyhow::Error),
    #[error("round failed: {0:#}")]
    Unknown(anyhow::Error),
}

impl RoundError {
    pub fn source_tag(&self) -> &'static str {
        match self {
            RoundError::ScriptLoad(_) => "script_load",
            RoundError::LlmCall(_) => "llm_call",
            RoundError::Unknown(_) => "unknown",
        }
    }

    fn inner(&self) -> &anyhow::Error {
        match self {
            RoundError::ScriptLoad(e) | RoundError::LlmCall(e) | RoundError::Unknown(e) => e,
        }
    }
}

/// What the loop should do after a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundFlow {
    /// More work may be pending; run another round immediately.
    Continue,
    /// Block on the queue before the next round.
    Wait,
    /// `maxRounds` reached; stop the loop.
    Terminate,
}

// ── Agent ────────────────────────────────────────────────────

/// A running agent bound to one workspace.
pub struct Agent {
    pub workspace: PathBuf,
    pub queue: Arc<MessageQueue>,
    pub jobs: Arc<JobRegistry>,
    pub status: SharedStatus,
    /// Consecutive assistant turns without tool calls.
    empty_turns: u32,
    repair_poll: Duration,
    repair_timeout: Duration,
}

impl Agent {
    pub fn new(
        workspace: PathBuf,
        queue: Arc<MessageQueue>,
        jobs: Arc<JobRegistry>,
        status: SharedStatus,
    ) -> Self {
        Self {
            workspace,
            queue,
            jobs,
            status,
            empty_turns: 0,
            repair_poll: REPAIR_POLL,
            repair_timeout: REPAIR_TIMEOUT,
        }
    }

    /// Override the repair cadence (useful in tests).
    pub fn with_repair_timing(mut self, poll: Duration, timeout: Duration) -> Self {
        self.repair_poll = poll;
        self.repair_timeout = timeout;
        self
    }

    async fn set_state(&self, state: RunState) {
        let mut status = self.status.write().await;
        status.state = state;
        if state != RunState::Error {
            status.error = None;
        }
    }

    /// Drive the loop until `maxRounds` (Ok) or a fatal failure (Err).
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(workspace = %self.workspace.display(), "agent loop started");
        loop {
            self.set_state(RunState::Waiting).await;
            self.queue.wait().await;

            loop {
                // A stale repair signal (no error active) is consumed
                // without any state change.
                consume_repair_signal(&self.workspace).await;

                self.set_state(RunState::Running).await;
                match self.run_round().await {
                    Ok(RoundFlow::Continue) => continue,
                    Ok(RoundFlow::Wait) => break,
                    Ok(RoundFlow::Terminate) => {
                        info!("max rounds reached, stopping loop");
                        return Ok(());
                    }
                    Err(round_err) => {
                        self.enter_error_state(round_err).await?;
                        // Repaired; fall through and retry with whatever is
                        // queued or already in context.
                    }
                }
            }
        }
    }

    /// One full round against the freshly loaded scripts.
    pub async fn run_round(&mut self) -> Result<RoundFlow, RoundError> {
        let agent_state = AgentState::load(&self.workspace)
            .await
            .map_err(RoundError::Unknown)?;

        if let Some(max) = agent_state.max_rounds {
            if agent_state.round >= max {
                return Ok(RoundFlow::Terminate);
            }
        }

        let provider = scripts::load_provider(
            &self.workspace,
            &agent_state.provider,
            agent_state.model.as_deref(),
        )
        .await
        .map_err(RoundError::ScriptLoad)?;
        let user_tools = scripts::load_tools(&self.workspace)
            .await
            .map_err(RoundError::ScriptLoad)?;

        self.run_round_with_provider(&agent_state, provider.as_ref(), user_tools)
            .await
    }

    /// Round body with an explicit provider and tool set (also the testing
    /// seam for mock providers).
    pub async fn run_round_with_provider(
        &mut self,
        agent_state: &AgentState,
        provider: &dyn Provider,
        user_tools: Vec<ToolScript>,
    ) -> Result<RoundFlow, RoundError> {
        let round = agent_state.round;
        debug!(round, provider = %agent_state.provider, "round started");

        // Drain inbound messages into context and persist immediately so
        // they survive a crash before the provider answers.
        let mut ctx = state::load_context(&self.workspace)
            .await
            .map_err(RoundError::Unknown)?;
        let batch = self.queue.drain();
        let mut round_messages: Vec<Message> = Vec::new();
        for msg in &batch {
            let m = Message::user(format!("[{}] {}", msg.source, msg.content));
            round_messages.push(m.clone());
            ctx.push(m);
        }
        state::save_context(&self.workspace, &ctx)
            .await
            .map_err(RoundError::Unknown)?;

        // Context management: repair any damage from external edits, prune,
        // and compact (compaction is best-effort).
        let mut dirty = context::repair_pairs(&mut ctx);
        dirty |= context::prune(&mut ctx);
        if context::needs_compaction(&ctx) {
            match context::compact(&self.workspace, &mut ctx, provider).await {
                Ok(did) => {
                    if did {
                        context::repair_pairs(&mut ctx);
                        dirty = true;
                    }
                }
                Err(e) => warn!(error = %e, "compaction failed, continuing with pruned context"),
            }
        }
        if dirty {
            state::save_context(&self.workspace, &ctx)
                .await
                .map_err(RoundError::Unknown)?;
        }

        // Provider call with the assembled system prompt.
        let system = self.assemble_system_prompt(agent_state).await;
        let tool_ctx = Arc::new(ToolContext::new(
            self.workspace.clone(),
            Arc::clone(&self.jobs),
            user_tools,
        ));
        let tool_defs = tool_ctx.tool_defs();

        let mut call_messages = Vec::with_capacity(ctx.len() + 1);
        call_messages.push(Message::system(system));
        call_messages.extend(ctx.iter().cloned());

        let outcome = chat_with_retry(provider, &call_messages, &tool_defs)
            .await
            .map_err(RoundError::LlmCall)?;

        // Append the assistant turn, then run its tools concurrently;
        // results land in declaration order.
        let assistant = Message::assistant(outcome.content.clone(), outcome.tool_calls.clone());
        round_messages.push(assistant.clone());
        ctx.push(assistant);

        let calls = outcome.tool_calls.clone().unwrap_or_default();
        let mut wants_wait = false;
        if !calls.is_empty() {
            let results = tools::execute_all(&tool_ctx, &calls).await;
            for result in results {
                wants_wait |= result.wants_wait;
                let m = Message::tool(result.call_id, result.content);
                round_messages.push(m.clone());
                ctx.push(m);
            }
        }

        state::save_context(&self.workspace, &ctx)
            .await
            .map_err(RoundError::Unknown)?;
        state::save_round(
            &self.workspace,
            &RoundRecord {
                round,
                timestamp: now_ms(),
                messages: round_messages,
                response: outcome.clone(),
                provider: agent_state.provider.clone(),
                model: agent_state.model.clone(),
            },
        )
        .await
        .map_err(RoundError::Unknown)?;

        // Re-read agent.json and bump only the counter so concurrent
        // self-edits (model switch, prompt change) survive.
        state::bump_round(&self.workspace)
            .await
            .map_err(RoundError::Unknown)?;

        // A turn without tool calls gets nudged back towards tools; three
        // in a row means the agent has nothing to do.
        if calls.is_empty() {
            self.empty_turns += 1;
            if self.empty_turns >= MAX_EMPTY_TURNS {
                warn!(round, "third consecutive turn without tool calls, entering wait");
                self.empty_turns = 0;
                return Ok(RoundFlow::Wait);
            }
            ctx.push(Message::user(NUDGE_MESSAGE));
            state::save_context(&self.workspace, &ctx)
                .await
                .map_err(RoundError::Unknown)?;
            debug!(round, nudges = self.empty_turns, "nudging agent towards tool use");
            return Ok(RoundFlow::Continue);
        }
        self.empty_turns = 0;

        debug!(round, wants_wait, "round complete");
        if wants_wait {
            Ok(RoundFlow::Wait)
        } else {
            Ok(RoundFlow::Continue)
        }
    }

    /// Base prompt + `prompt.md` fragment + workspace trailer.
    async fn assemble_system_prompt(&self, agent_state: &AgentState) -> String {
        let mut prompt = agent_state.system_prompt.clone();
        if let Ok(fragment) = tokio::fs::read_to_string(self.workspace.join("prompt.md")).await {
            if !fragment.trim().is_empty() {
                prompt.push_str("\n\n");
                prompt.push_str(fragment.trim_end());
            }
        }
        let abs = self
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| self.workspace.clone());
        prompt.push_str(&format!("\n\nYour workspace is at: {}", abs.display()));
        prompt
    }

    // ── Error state & repair ─────────────────────────────────

    /// Park the loop until repaired. `Ok(())` means the error cleared;
    /// `Err` means the repair budget ran out and the process must die.
    pub async fn enter_error_state(&mut self, round_err: RoundError) -> anyhow::Result<()> {
        let record = ErrorRecord {
            source: round_err.source_tag().to_string(),
            message: round_err.inner().to_string(),
            stack: format!("{:?}", round_err.inner()),
            timestamp: now_ms(),
        };
        error!(source = %record.source, message = %record.message, "entering error state");
        {
            let mut status = self.status.write().await;
            status.state = RunState::Error;
            status.error = Some(record.clone());
        }

        notify_parent(&self.workspace, &record).await;

        let deadline = tokio::time::Instant::now() + self.repair_timeout;
        loop {
            if consume_repair_signal(&self.workspace).await {
                info!("repair signal received, resuming");
                break;
            }
            let provider_name = AgentState::load(&self.workspace)
                .await
                .map(|s| s.provider)
                .unwrap_or_default();
            if !provider_name.is_empty()
                && scripts::probe(&self.workspace, &provider_name).await.is_ok()
            {
                info!("script probe succeeded, resuming");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "repair timeout: still in error state ({}) after {}s",
                    record.source,
                    self.repair_timeout.as_secs()
                );
            }
            tokio::time::sleep(self.repair_poll).await;
        }

        self.set_state(RunState::Running).await;
        Ok(())
    }
}

/// Remove `.repair-signal` if present; returns whether it existed.
pub async fn consume_repair_signal(workspace: &Path) -> bool {
    tokio::fs::remove_file(workspace.join(".repair-signal"))
        .await
        .is_ok()
}

/// Best-effort error notification to the supervising parent.
async fn notify_parent(workspace: &Path, record: &ErrorRecord) {
    let Ok(base) = std::env::var("REPAIR_AGENT_URL") else {
        return;
    };
    if base.is_empty() {
        return;
    }
    let url = format!("{}/message", base.trim_end_matches('/'));
    let body = serde_json::json!({
        "content": format!(
            "Worker at {} entered error state ({}): {}",
            workspace.display(), record.source, record.message
        ),
        "source": "repair:worker",
        "metadata": record,
    });
    match reqwest::Client::new()
        .post(&url)
        .json(&body)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(resp) => debug!(status = %resp.status(), "parent notified of error state"),
        Err(e) => warn!(error = %e, "failed to notify parent of error state"),
    }
}

// ── Tests ────────────────────────────────────────────────────
