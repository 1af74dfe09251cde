//! Shell tools: `bash` and `bash_kill`, backed by the job registry.
//!
//! A command starts synchronous: if it finishes within the async threshold
//! its output comes back inline (truncated to 100 lines; the streamed
//! output file is kept only when truncation happened). A command that runs
//! longer — or is called with `async: true` — becomes a background job: the
//! result carries the job id and output path, and a `system:bash` queue
//! message wakes the agent when the job exits.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::jobs::JobRegistry;
use crate::models::ToolDef;

/// A sync command that outlives this threshold transitions to async.
pub const ASYNC_THRESHOLD: Duration = Duration::from_secs(5);
/// Inline output is cut to this many lines.
pub const INLINE_LINE_LIMIT: usize = 100;

pub async fn bash(
    jobs: &Arc<JobRegistry>,
    workspace: &Path,
    args: &Value,
) -> anyhow::Result<(String, bool)> {
    let command = args
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("bash requires `command`"))?;
    let async_mode = args.get("async").and_then(Value::as_bool).unwrap_or(false);

    let mut job = jobs.spawn(workspace, command, async_mode).await?;

    if async_mode {
        return Ok((async_result(&job.id, &job.output_path.display().to_string()), false));
    }

    tokio::select! {
        res = &mut job.exit => {
            let code = res.unwrap_or(-1);
            inline_result(&job.output_path, code).await
        }
        _ = tokio::time::sleep(ASYNC_THRESHOLD) => {
            if jobs.mark_async(&job.id) {
                Ok((async_result(&job.id, &job.output_path.display().to_string()), false))
            } else {
                // Finished right on the threshold; take the sync path.
                let code = job.exit.await.unwrap_or(-1);
                inline_result(&job.output_path, code).await
            }
        }
    }
}

/// Build the inline result for a completed sync command. Short output
/// deletes the transient stream file; truncated output keeps it.
async fn inline_result(output_path: &Path, code: i32) -> anyhow::Result<(String, bool)> {
    let raw = tokio::fs::read_to_string(output_path)
        .await
        .unwrap_or_default();
    let lines: Vec<&str> = raw.lines().collect();

    let result = if lines.len() > INLINE_LINE_LIMIT {
        let shown = lines[..INLINE_LINE_LIMIT].join("\n");
        let hidden = lines.len() - INLINE_LINE_LIMIT;
        // The full text survives only in the truncated case.
        if let Ok(mut f) = tokio::fs::OpenOptions::new()
            .append(true)
            .open(output_path)
            .await
        {
            use tokio::io::AsyncWriteExt;
            let _ = f
                .write_all(format!("[exit code: {code}]\n").as_bytes())
                .await;
        }
        format!(
            "{shown}\n... [{hidden} more lines; full output at {}]\n[exit code: {code}]",
            output_path.display()
        )
    } else {
        let _ = tokio::fs::remove_file(output_path).await;
        if raw.is_empty() {
            format!("[exit code: {code}]")
        } else {
            format!("{raw}[exit code: {code}]")
        }
    };
    Ok((result, false))
}

fn async_result(id: &str, output_path: &str) -> String {
    format!(
        "Command running in background.\njob id: {id}\noutput: {output_path}\n\
         The output file streams in real time; read it with read_file. \
         You will receive a [system:bash] message when the job exits, \
         or stop it early with bash_kill {{\"id\": \"{id}\"}}."
    )
}

pub async fn bash_kill(jobs: &Arc<JobRegistry>, args: &Value) -> anyhow::Result<(String, bool)> {
    let id = args
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("bash_kill requires `id`"))?;
    match jobs.kill(id).await {
        Some(info) => Ok((
            format!(
                "Killed job {id} (`{}`). Output preserved at {}",
                info.command,
                info.output_path.display()
            ),
            false,
        )),
        None => anyhow::bail!("no background job with id \"{id}\""),
    }
}

pub fn defs() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "bash".into(),
            description: "Run a shell command in the workspace (via `sh -c`). Commands finishing \
                          within 5s return output inline (first 100 lines); longer commands \
                          continue as background jobs that message you on exit. Pass async=true \
                          to background immediately."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to execute"},
                    "async": {"type": "boolean", "description": "Background the command immediately (default false)"}
                },
                "required": ["command"]
            }),
        },
        ToolDef {
            name: "bash_kill".into(),
            description: "Terminate a background job started by bash (SIGTERM, then SIGKILL after 2s)."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string", "description": "Background job id"}
                },
                "required": ["id"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::MessageQueue;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MessageQueue>, Arc<JobRegistry>) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(MessageQueue::new());
        let registry = Arc::new(JobRegistry::new(Arc::clone(&queue)));
        (dir, queue, registry)
    }

    #[tokio::test]
    async fn quick_command_returns_inline_and_cleans_up() {
        let (dir, _queue, jobs) = setup();
        let (result, wait) = bash(&jobs, dir.path(), &json!({"command": "echo hi"}))
            .await
            .unwrap();
        assert!(!wait);
        assert!(result.starts_with("hi"));
        assert!(result.contains("[exit code: 0]"));

        // Inline completion leaves no stream file behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(".tool-output"))
            .map(|rd| rd.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn exactly_100_lines_stays_inline() {
        let (dir, _queue, jobs) = setup();
        let (result, _) = bash(&jobs, dir.path(), &json!({"command": "seq 1 100"}))
            .await
            .unwrap();
        assert!(result.contains("\n100\n"));
        assert!(!result.contains("more lines"));
    }

    #[tokio::test]
    async fn over_100_lines_truncates_and_keeps_file() {
        let (dir, _queue, jobs) = setup();
        let (result, _) = bash(&jobs, dir.path(), &json!({"command": "seq 1 101"}))
            .await
            .unwrap();
        assert!(result.contains("[1 more lines"));
        assert!(!result.contains("\n101\n"));

        let files: Vec<_> = std::fs::read_dir(dir.path().join(".tool-output"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 1);
        let full = std::fs::read_to_string(files[0].path()).unwrap();
        assert!(full.contains("101"));
    }

    #[tokio::test]
    async fn explicit_async_returns_job_id() {
        let (dir, queue, jobs) = setup();
        let (result, wait) = bash(
            &jobs,
            dir.path(),
            &json!({"command": "sleep 0.1 && echo DONE", "async": true}),
        )
        .await
        .unwrap();
        assert!(!wait);
        assert!(result.contains("job id:"));

        // Exit notification lands in the queue.
        tokio::time::timeout(Duration::from_secs(3), queue.wait())
            .await
            .expect("job exit should wake the queue");
        let batch = queue.drain();
        assert_eq!(batch[0].source, "system:bash");
    }

    #[tokio::test]
    async fn bash_kill_unknown_id_is_error() {
        let (_dir, _queue, jobs) = setup();
        let err = bash_kill(&jobs, &json!({"id": "deadbeef"})).await.unwrap_err();
        assert!(err.to_string().contains("deadbeef"));
    }

    #[tokio::test]
    async fn bash_kill_stops_async_job() {
        let (dir, _queue, jobs) = setup();
        let (result, _) = bash(
            &jobs,
            dir.path(),
            &json!({"command": "sleep 30", "async": true}),
        )
        .await
        .unwrap();
        let id = result
            .lines()
            .find_map(|l| l.strip_prefix("job id: "))
            .unwrap()
            .to_string();

        let (confirmation, _) = bash_kill(&jobs, &json!({"id": id})).await.unwrap();
        assert!(confirmation.contains("Killed job"));
        assert!(jobs.get(&id).is_none());
    }

    #[tokio::test]
    async fn missing_command_is_error() {
        let (dir, _queue, jobs) = setup();
        assert!(bash(&jobs, dir.path(), &json!({})).await.is_err());
    }
}
