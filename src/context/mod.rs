//! Context window management: pruning, compaction, and pair repair.
//!
//! Keeps `memory/context.json` within budget so long-lived agents never
//! silently hit provider limits. Costs are approximated by character count
//! (~4 chars/token).
//!
//! Three layers, applied in order by the executor:
//! 1. **Pruning** — rewrites old tool results in place (soft trim, then a
//!    hard clear at a higher threshold). Cheap, runs every round, persisted.
//! 2. **Compaction** — when pruning isn't enough, the oldest two-thirds of
//!    the context is summarised by the model itself and replaced with a
//!    single summary message; partials are appended to `memory/summary.md`.
//! 3. **Pair repair** — after any structural edit, tool-call/result pairings
//!    are made whole again: orphaned results dropped, missing ones replaced
//!    by synthetic placeholders.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use crate::models::{Message, Provider};
use crate::state;

/// Pruning starts at this many chars.
pub const PRUNE_THRESHOLD: usize = 80_000;
/// At this size, old tool results are cleared outright instead of trimmed.
pub const HARD_THRESHOLD: usize = 120_000;
/// Above this (after pruning), compaction runs.
pub const COMPACT_THRESHOLD: usize = 160_000;

/// Soft pruning rewrites tool results longer than this.
const SOFT_RESULT_LIMIT: usize = 4_000;
/// Soft pruning keeps this many chars of head and of tail.
const SOFT_KEEP: usize = 1_500;
/// Hard pruning clears tool results longer than this.
const HARD_RESULT_LIMIT: usize = 100;
/// Tool results belonging to the last N assistant turns are never touched.
const KEEP_RECENT_ASSISTANTS: usize = 3;
/// Compaction feeds the summariser at most this many chars per call.
const CHUNK_LIMIT: usize = 30_000;

pub const HARD_CLEAR_PLACEHOLDER: &str = "[Tool result cleared to save context space]";
pub const REPAIR_PLACEHOLDER: &str = "[Result cleared during context compaction]";

const SUMMARISER_PROMPT: &str = "You are a conversation summariser. Condense the \
following agent conversation log into a compact summary. Preserve key facts, \
decisions, file paths, tool outcomes, and open tasks. Omit greetings and filler. \
Reply with the summary only.";

/// Total approximate size of the context in characters.
pub fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_count).sum()
}

// ── Pruning ──────────────────────────────────────────────────

/// Index of the first message belonging to the last
/// [`KEEP_RECENT_ASSISTANTS`] assistant turns; tool results at or after this
/// index are never pruned.
fn prune_cutoff(messages: &[Message]) -> usize {
    let mut assistants_seen = 0;
    for (idx, msg) in messages.iter().enumerate().rev() {
        if msg.role == "assistant" {
            assistants_seen += 1;
            if assistants_seen == KEEP_RECENT_ASSISTANTS {
                return idx;
            }
        }
    }
    0
}

/// Rewrite old tool results when the context is over budget.
///
/// Returns `true` when any message changed; the caller persists so the
/// context does not re-inflate on reload.
pub fn prune(messages: &mut [Message]) -> bool {
    let total = total_chars(messages);
    if total < PRUNE_THRESHOLD {
        return false;
    }
    let hard = total >= HARD_THRESHOLD;
    let cutoff = prune_cutoff(messages);
    let mut changed = false;

    for msg in messages[..cutoff].iter_mut() {
        if msg.role != "tool" {
            continue;
        }
        let Some(content) = msg.content.as_ref() else {
            continue;
        };
        if hard {
            if content.len() > HARD_RESULT_LIMIT {
                msg.content = Some(HARD_CLEAR_PLACEHOLDER.to_string());
                changed = true;
            }
        } else if content.len() > SOFT_RESULT_LIMIT {
            let head = head_chars(content, SOFT_KEEP);
            let tail = tail_chars(content, SOFT_KEEP);
            let trimmed = content.len() - head.len() - tail.len();
            msg.content = Some(format!(
                "{head}\n...[{trimmed} chars trimmed to save context space]...\n{tail}"
            ));
            changed = true;
        }
    }

    if changed {
        debug!(
            before = total,
            after = total_chars(messages),
            hard,
            "pruned old tool results"
        );
    }
    changed
}

fn head_chars(s: &str, n: usize) -> &str {
    let mut end = n.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn tail_chars(s: &str, n: usize) -> &str {
    let mut start = s.len().saturating_sub(n);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

// ── Compaction ───────────────────────────────────────────────

/// Whether the (already pruned) context warrants compaction.
pub fn needs_compaction(messages: &[Message]) -> bool {
    total_chars(messages) >= COMPACT_THRESHOLD
}

/// Pick the compaction split: target the last third of messages, then walk
/// forward to the next user message so tool pairings are never divided.
/// Returns `None` when no valid split exists.
fn find_split(messages: &[Message]) -> Option<usize> {
    if messages.len() < 3 {
        return None;
    }
    let mut idx = messages.len() - messages.len() / 3;
    while idx < messages.len() && messages[idx].role != "user" {
        idx += 1;
    }
    if idx == 0 || idx >= messages.len() {
        None
    } else {
        Some(idx)
    }
}

/// Summarise everything before the split via the provider and replace it
/// with a single `[Previous context summary]` user message.
///
/// Partial summaries are appended to `memory/summary.md`. The caller treats
/// failure as best-effort: the pruned context is still usable.
pub async fn compact(
    workspace: &Path,
    messages: &mut Vec<Message>,
    provider: &dyn Provider,
) -> anyhow::Result<bool> {
    let Some(split) = find_split(messages) else {
        debug!("no valid compaction split found");
        return Ok(false);
    };

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for msg in &messages[..split] {
        let line = format!(
            "[{}] {}\n",
            msg.role,
            msg.content.as_deref().unwrap_or_else(|| {
                if msg.tool_calls.is_some() {
                    "(tool calls)"
                } else {
                    ""
                }
            })
        );
        if current.len() + line.len() > CHUNK_LIMIT && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(&line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let mut partials: Vec<String> = Vec::new();
    for chunk in &chunks {
        let outcome = provider
            .chat(
                &[Message::system(SUMMARISER_PROMPT), Message::user(chunk.clone())],
                &[],
            )
            .await?;
        partials.push(outcome.content.unwrap_or_default());
    }
    let summary = partials.join("\n\n");

    state::append_summary(workspace, &summary).await?;

    let mut compacted = vec![Message::user(format!("[Previous context summary]\n{summary}"))];
    compacted.extend_from_slice(&messages[split..]);

    debug!(
        old_messages = messages.len(),
        new_messages = compacted.len(),
        chunks = chunks.len(),
        "context compacted"
    );
    *messages = compacted;
    Ok(true)
}

// ── Pair repair ──────────────────────────────────────────────

/// Restore the tool-pairing invariant after structural edits.
///
/// Drops tool messages whose id was never declared by an earlier assistant
/// (or was already answered), then inserts a synthetic placeholder result
/// for every assistant call left without one. Returns `true` on change.
pub fn repair_pairs(messages: &mut Vec<Message>) -> bool {
    let mut declared: HashSet<String> = HashSet::new();
    let mut answered: HashSet<String> = HashSet::new();
    let mut kept: Vec<Message> = Vec::with_capacity(messages.len());
    let mut changed = false;

    for msg in messages.drain(..) {
        if msg.role == "tool" {
            let valid_id = match msg.tool_call_id.as_deref() {
                Some(id) if declared.contains(id) && !answered.contains(id) => {
                    Some(id.to_string())
                }
                _ => None,
            };
            if let Some(id) = valid_id {
                answered.insert(id);
                kept.push(msg);
            } else {
                warn!(id = ?msg.tool_call_id, "dropping orphaned tool result");
                changed = true;
            }
        } else {
            if msg.role == "assistant" {
                if let Some(ref calls) = msg.tool_calls {
                    for c in calls {
                        declared.insert(c.id.clone());
                    }
                }
            }
            kept.push(msg);
        }
    }

    // Second pass: synthesise results for unanswered calls, placed directly
    // after the declaring assistant message.
    let mut out: Vec<Message> = Vec::with_capacity(kept.len());
    for msg in kept {
        let missing: Vec<String> = if msg.role == "assistant" {
            msg.tool_calls
                .as_ref()
                .map(|calls| {
                    calls
                        .iter()
                        .filter(|c| !answered.contains(&c.id))
                        .map(|c| c.id.clone())
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        out.push(msg);
        for id in missing {
            warn!(%id, "inserting synthetic result for unanswered tool call");
            answered.insert(id.clone());
            out.push(Message::tool(id, REPAIR_PLACEHOLDER));
            changed = true;
        }
    }

    *messages = out;
    changed
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatOutcome, ToolCall, ToolDef};
    use async_trait::async_trait;
    use serde_json::json;

    fn filler(role: &str, chars: usize) -> Message {
        Message {
            role: role.into(),
            content: Some("x".repeat(chars)),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_result(id: &str, chars: usize) -> Message {
        Message::tool(id, "y".repeat(chars))
    }

    /// Context shape: one old tool result followed by three recent
    /// assistant turns, padded to an exact total size.
    fn context_of(total: usize, old_result_chars: usize) -> Vec<Message> {
        let mut msgs = vec![
            Message::assistant(
                None,
                Some(vec![ToolCall {
                    id: "c0".into(),
                    name: "bash".into(),
                    args: json!({}),
                }]),
            ),
            tool_result("c0", old_result_chars),
        ];
        msgs.push(filler("assistant", 10));
        msgs.push(filler("assistant", 10));
        msgs.push(filler("assistant", 10));
        let used = total_chars(&msgs);
        assert!(used <= total, "base context larger than requested total");
        msgs.insert(0, filler("user", total - used));
        msgs
    }

    #[test]
    fn below_threshold_no_pruning() {
        let mut msgs = context_of(PRUNE_THRESHOLD - 1, 5_000);
        assert!(!prune(&mut msgs));
        assert_eq!(msgs[2].content.as_ref().unwrap().len(), 5_000);
    }

    #[test]
    fn soft_prune_trims_large_old_results() {
        let mut msgs = context_of(PRUNE_THRESHOLD, 5_000);
        assert!(prune(&mut msgs));
        let content = msgs[2].content.as_ref().unwrap();
        assert!(content.contains("trimmed"));
        assert!(content.len() < 5_000);
        assert!(content.starts_with(&"y".repeat(100)));
        assert!(content.ends_with(&"y".repeat(100)));
    }

    #[test]
    fn soft_prune_leaves_small_results() {
        let mut msgs = context_of(PRUNE_THRESHOLD, 3_000);
        prune(&mut msgs);
        assert_eq!(msgs[2].content.as_ref().unwrap().len(), 3_000);
    }

    #[test]
    fn hard_prune_clears_old_results() {
        let mut msgs = context_of(HARD_THRESHOLD, 3_000);
        assert!(prune(&mut msgs));
        assert_eq!(
            msgs[2].content.as_deref(),
            Some(HARD_CLEAR_PLACEHOLDER)
        );
    }

    #[test]
    fn recent_assistant_results_are_protected() {
        // The tool result sits inside the last three assistant turns.
        let mut msgs = vec![
            filler("user", PRUNE_THRESHOLD),
            filler("assistant", 10),
            Message::assistant(
                None,
                Some(vec![ToolCall {
                    id: "c1".into(),
                    name: "bash".into(),
                    args: json!({}),
                }]),
            ),
            tool_result("c1", 10_000),
            filler("assistant", 10),
        ];
        prune(&mut msgs);
        assert_eq!(msgs[3].content.as_ref().unwrap().len(), 10_000);
    }

    #[test]
    fn split_walks_forward_to_user_message() {
        let msgs = vec![
            filler("user", 10),
            filler("assistant", 10),
            filler("user", 10),
            filler("assistant", 10),
            tool_result("c9", 10),
            filler("user", 10),
            filler("assistant", 10),
            filler("user", 10),
            filler("assistant", 10),
        ];
        let split = find_split(&msgs).unwrap();
        // Target index 6 is an assistant; the walk lands on the user at 7.
        assert_eq!(msgs[split].role, "user");
        assert_eq!(split, 7);
    }

    #[derive(Debug)]
    struct CannedSummariser;

    #[async_trait]
    impl Provider for CannedSummariser {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: &[ToolDef],
        ) -> anyhow::Result<ChatOutcome> {
            Ok(ChatOutcome {
                content: Some("the gist".into()),
                tool_calls: None,
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn compact_replaces_prefix_and_logs_summary() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut msgs: Vec<Message> = Vec::new();
        for _ in 0..6 {
            msgs.push(filler("user", 2_000));
            msgs.push(filler("assistant", 2_000));
        }

        let did = compact(dir.path(), &mut msgs, &CannedSummariser)
            .await
            .unwrap();
        assert!(did);
        assert!(msgs[0]
            .content
            .as_ref()
            .unwrap()
            .starts_with("[Previous context summary]"));
        assert!(msgs[0].content.as_ref().unwrap().contains("the gist"));
        assert!(msgs.len() < 13);

        let log = std::fs::read_to_string(dir.path().join("memory/summary.md")).unwrap();
        assert!(log.contains("the gist"));
    }

    #[test]
    fn repair_drops_orphans_and_duplicates() {
        let mut msgs = vec![
            Message::assistant(
                None,
                Some(vec![ToolCall {
                    id: "c1".into(),
                    name: "think".into(),
                    args: json!({}),
                }]),
            ),
            Message::tool("c1", "OK"),
            Message::tool("c1", "OK again"),
            Message::tool("ghost", "orphan"),
        ];
        assert!(repair_pairs(&mut msgs));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn repair_inserts_placeholder_for_missing_results() {
        let mut msgs = vec![
            Message::assistant(
                None,
                Some(vec![
                    ToolCall {
                        id: "a".into(),
                        name: "bash".into(),
                        args: json!({}),
                    },
                    ToolCall {
                        id: "b".into(),
                        name: "reply".into(),
                        args: json!({}),
                    },
                ]),
            ),
            Message::tool("b", "sent"),
            Message::user("[t] next"),
        ];
        assert!(repair_pairs(&mut msgs));
        // Synthetic result for "a" inserted after the assistant message.
        assert_eq!(msgs[1].tool_call_id.as_deref(), Some("a"));
        assert_eq!(msgs[1].content.as_deref(), Some(REPAIR_PLACEHOLDER));
        assert_eq!(msgs[2].tool_call_id.as_deref(), Some("b"));
    }

    #[test]
    fn repair_noop_on_healthy_context() {
        let mut msgs = vec![
            Message::user("[t] hi"),
            Message::assistant(
                Some("done".into()),
                Some(vec![ToolCall {
                    id: "c".into(),
                    name: "reply".into(),
                    args: json!({}),
                }]),
            ),
            Message::tool("c", "sent"),
        ];
        assert!(!repair_pairs(&mut msgs));
        assert_eq!(msgs.len(), 3);
    }
}
