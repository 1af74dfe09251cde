//! Shared helpers for the integration suites: a scripted mock
//! OpenAI-compatible endpoint and a fully wired agent harness.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use burrow::agent::{new_status, Agent, SharedStatus};
use burrow::comm::MessageQueue;
use burrow::jobs::JobRegistry;
use burrow::{gateway, workspace};

/// Find a free port by binding to :0 and reading the assigned address.
pub async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// OpenAI-style response carrying tool calls.
pub fn tool_call_response(calls: &[(&str, &str, Value)]) -> Value {
    let wire: Vec<Value> = calls
        .iter()
        .map(|(id, name, args)| {
            json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": args.to_string() }
            })
        })
        .collect();
    json!({
        "choices": [{ "message": { "content": null, "tool_calls": wire } }],
        "usage": { "prompt_tokens": 20, "completion_tokens": 10, "total_tokens": 30 }
    })
}

/// OpenAI-style plain text response.
#[allow(dead_code)]
pub fn text_response(text: &str) -> Value {
    json!({
        "choices": [{ "message": { "content": text } }],
        "usage": { "prompt_tokens": 20, "completion_tokens": 10, "total_tokens": 30 }
    })
}

/// Start a mock chat-completions endpoint that plays back `script` in
/// order. Once exhausted it answers with a lone `wait_for` call so the
/// agent parks instead of spinning.
pub async fn start_mock_llm(script: Vec<Value>) -> SocketAddr {
    let script: Arc<Mutex<VecDeque<Value>>> = Arc::new(Mutex::new(script.into()));
    let fallback_seq = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |_body: Json<Value>| {
            let script = Arc::clone(&script);
            let fallback_seq = Arc::clone(&fallback_seq);
            async move {
                let next = script.lock().await.pop_front().unwrap_or_else(|| {
                    // Unique call ids so fallback rounds never collide.
                    let n = fallback_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let id = format!("call_wait_{n}");
                    tool_call_response(&[(id.as_str(), "wait_for", json!({}))])
                });
                Json(next)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Point the workspace's provider spec at a mock endpoint.
pub fn write_provider_spec(workspace: &Path, llm_addr: SocketAddr) {
    std::fs::write(
        workspace.join("scripts/providers/openai.json"),
        json!({ "endpoint": format!("http://{llm_addr}/v1/chat/completions") }).to_string(),
    )
    .unwrap();
}

/// Everything a scenario needs to drive one live agent.
pub struct Harness {
    pub addr: SocketAddr,
    pub queue: Arc<MessageQueue>,
    pub status: SharedStatus,
    pub agent_task: tokio::task::JoinHandle<anyhow::Result<()>>,
    server_task: tokio::task::JoinHandle<()>,
}

impl Harness {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn stop(self) {
        self.agent_task.abort();
        self.server_task.abort();
    }
}

/// Initialise a worker workspace wired to `llm_addr` and start the HTTP
/// surface plus the executor loop.
pub async fn spawn_agent(ws: &Path, llm_addr: SocketAddr) -> Harness {
    workspace::init(ws, workspace::ROLE_WORKER).await.unwrap();
    write_provider_spec(ws, llm_addr);

    let queue = Arc::new(MessageQueue::new());
    let jobs = Arc::new(JobRegistry::new(Arc::clone(&queue)));
    let status = new_status();

    let server = gateway::start_server(
        free_addr().await,
        ws.to_path_buf(),
        Arc::clone(&queue),
        Arc::clone(&status),
    )
    .await
    .unwrap();

    let mut agent = Agent::new(
        ws.to_path_buf(),
        Arc::clone(&queue),
        Arc::clone(&jobs),
        Arc::clone(&status),
    )
    .with_repair_timing(Duration::from_millis(100), Duration::from_secs(10));
    let agent_task = tokio::spawn(async move { agent.run().await });

    Harness {
        addr: server.addr,
        queue,
        status,
        agent_task,
        server_task: server.handle,
    }
}

/// Poll `f` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
