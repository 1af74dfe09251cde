//! Background job registry.
//!
//! Owns every child process spawned by the `bash` tool. Output is streamed
//! line-by-line into `.tool-output/<id>.txt` from the moment of spawn
//! (stderr lines prefixed `[stderr] `), so a job's output is observable
//! while it runs. On exit of a job in async mode the registry appends
//! `[exit code: N]`, unregisters the job, and pushes a `system:bash`
//! message straight into the agent's queue so the executor wakes.
//!
//! One registry per OS process, shared by `bash` and `bash_kill` through the
//! tool context.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::comm::MessageQueue;
use crate::utils;

/// Default wall-clock limit for a command that stays synchronous.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period between SIGTERM and SIGKILL in [`JobRegistry::kill`].
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Registry entry for one live job.
struct JobEntry {
    command: String,
    output_path: PathBuf,
    pid: i32,
    /// When set, exit appends the exit-code line and wakes the agent.
    notify_on_exit: bool,
    /// Cancelling this makes the watcher SIGKILL the child.
    force_kill: CancellationToken,
    /// Cancelling this disarms the sync-mode kill timer.
    sync_timer: CancellationToken,
}

/// Snapshot of a registered job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub command: String,
    pub output_path: PathBuf,
}

/// Handle returned by [`JobRegistry::spawn`]; resolves when the child exits.
pub struct RunningJob {
    pub id: String,
    pub output_path: PathBuf,
    pub exit: oneshot::Receiver<i32>,
}

/// Process-wide map of running background jobs.
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
    queue: Arc<MessageQueue>,
}

impl JobRegistry {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            queue,
        }
    }

    /// Spawn `sh -c command` in the workspace, streaming output to
    /// `.tool-output/<id>.txt`. The job is registered immediately;
    /// `async_mode` decides whether exit wakes the agent or merely resolves
    /// the returned handle.
    pub async fn spawn(
        self: &Arc<Self>,
        workspace: &Path,
        command: &str,
        async_mode: bool,
    ) -> anyhow::Result<RunningJob> {
        let id = utils::job_id();
        let out_dir = workspace.join(".tool-output");
        tokio::fs::create_dir_all(&out_dir)
            .await
            .context("create .tool-output dir")?;
        let output_path = out_dir.join(format!("{id}.txt"));
        let file = tokio::fs::File::create(&output_path)
            .await
            .with_context(|| format!("create {}", output_path.display()))?;
        let file = Arc::new(tokio::sync::Mutex::new(file));

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn `{command}`"))?;

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        let force_kill = CancellationToken::new();
        let sync_timer = CancellationToken::new();

        {
            let mut jobs = self.jobs.lock().expect("job registry poisoned");
            jobs.insert(
                id.clone(),
                JobEntry {
                    command: command.to_string(),
                    output_path: output_path.clone(),
                    pid,
                    notify_on_exit: async_mode,
                    force_kill: force_kill.clone(),
                    sync_timer: sync_timer.clone(),
                },
            );
        }

        // Streamers: one per pipe, sharing the output file.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_writer = {
            let file = Arc::clone(&file);
            tokio::spawn(async move {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let mut f = file.lock().await;
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                        let _ = f.flush().await;
                    }
                }
            })
        };
        let err_writer = {
            let file = Arc::clone(&file);
            tokio::spawn(async move {
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let mut f = file.lock().await;
                        let _ = f.write_all(b"[stderr] ").await;
                        let _ = f.write_all(line.as_bytes()).await;
                        let _ = f.write_all(b"\n").await;
                        let _ = f.flush().await;
                    }
                }
            })
        };

        // Sync-mode kill timer: SIGTERM after SYNC_TIMEOUT unless disarmed
        // by the async transition or by exit.
        if !async_mode {
            let timer = sync_timer.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(SYNC_TIMEOUT) => {
                        warn!(pid, "sync command exceeded {}s, sending SIGTERM", SYNC_TIMEOUT.as_secs());
                        send_sigterm(pid);
                    }
                }
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let registry = Arc::clone(self);
        let watcher_id = id.clone();
        let kill_token = force_kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_token.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);

            // Let the streamers drain before anyone reads the file.
            let _ = out_writer.await;
            let _ = err_writer.await;

            registry.finish(&watcher_id, code).await;
            let _ = exit_tx.send(code);
        });

        debug!(%id, command, async_mode, "background job spawned");
        Ok(RunningJob {
            id,
            output_path,
            exit: exit_rx,
        })
    }

    /// Exit handling: unregister, and in async mode append the exit-code
    /// line and wake the agent. Best-effort by design.
    async fn finish(&self, id: &str, code: i32) {
        let entry = {
            let mut jobs = self.jobs.lock().expect("job registry poisoned");
            jobs.remove(id)
        };
        let Some(entry) = entry else { return };
        entry.sync_timer.cancel();

        if !entry.notify_on_exit {
            return;
        }

        if let Ok(mut f) = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&entry.output_path)
            .await
        {
            let _ = f
                .write_all(format!("[exit code: {code}]\n").as_bytes())
                .await;
        }

        self.queue.push(
            format!(
                "Background job {id} finished with exit code {code}. Command: `{}`. Full output: {}",
                entry.command,
                entry.output_path.display()
            ),
            "system:bash",
            None,
        );
        debug!(%id, code, "background job finished, agent notified");
    }

    /// Flip a still-running sync job into async mode, disarming the sync
    /// kill timer. Returns `false` when the job already finished.
    pub fn mark_async(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().expect("job registry poisoned");
        match jobs.get_mut(id) {
            Some(entry) => {
                entry.notify_on_exit = true;
                entry.sync_timer.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<JobInfo> {
        let jobs = self.jobs.lock().expect("job registry poisoned");
        jobs.get(id).map(|e| JobInfo {
            id: id.to_string(),
            command: e.command.clone(),
            output_path: e.output_path.clone(),
        })
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().expect("job registry poisoned");
        jobs.iter()
            .map(|(id, e)| JobInfo {
                id: id.clone(),
                command: e.command.clone(),
                output_path: e.output_path.clone(),
            })
            .collect()
    }

    /// Gracefully terminate a job: SIGTERM, then SIGKILL after a 2 s grace
    /// period. Returns the job's info, or `None` for an unknown id.
    pub async fn kill(&self, id: &str) -> Option<JobInfo> {
        let (info, pid, force) = {
            let jobs = self.jobs.lock().expect("job registry poisoned");
            let entry = jobs.get(id)?;
            (
                JobInfo {
                    id: id.to_string(),
                    command: entry.command.clone(),
                    output_path: entry.output_path.clone(),
                },
                entry.pid,
                entry.force_kill.clone(),
            )
        };

        send_sigterm(pid);

        // Wait for the watcher to reap it; escalate if it ignores SIGTERM.
        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        loop {
            if self.get(id).is_none() {
                return Some(info);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(%id, "job ignored SIGTERM, force-killing");
                force.cancel();
                // Give the SIGKILL a moment to land.
                for _ in 0..20 {
                    if self.get(id).is_none() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                return Some(info);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// SIGTERM a child by pid. Guards against pid <= 0: `kill(-1, …)` would
/// signal every process this user can reach.
fn send_sigterm(pid: i32) {
    if pid > 0 {
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    }
}

// ── Tests ────────────────────────────────────────────────────
