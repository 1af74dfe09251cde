//! End-to-end scenarios: a live agent loop against a scripted mock
//! provider, driven entirely through the HTTP surface.

mod common;

use std::time::Duration;

use common::{spawn_agent, start_mock_llm, tool_call_response, wait_until};
use serde_json::{json, Value};
use tempfile::TempDir;

#[tokio::test]
async fn echo_round_end_to_end() {
    let dir = TempDir::new().unwrap();
    let llm = start_mock_llm(vec![tool_call_response(&[
        (
            "call_1",
            "reply",
            json!({"source": "test:1", "content": "Echo: hi"}),
        ),
        ("call_2", "wait_for", json!({})),
    ])])
    .await;
    let harness = spawn_agent(dir.path(), llm).await;

    let resp = reqwest::Client::new()
        .post(harness.url("/message"))
        .json(&json!({"content": "hi", "source": "test:1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // The reply appears in the outbox once the round completes.
    let url = harness.url("/outbox");
    let delivered = wait_until(Duration::from_secs(10), || {
        let url = url.clone();
        async move {
            let listed: Vec<Value> = reqwest::get(&url).await.unwrap().json().await.unwrap();
            listed
                .iter()
                .any(|m| m["source"] == "test:1" && m["content"] == "Echo: hi")
        }
    })
    .await;
    assert!(delivered, "echo reply never reached the outbox");

    // The round advanced and left a history record.
    let status: Value = reqwest::get(harness.url("/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status["round"].as_u64().unwrap() >= 1);
    assert!(dir.path().join("history/round-00000.json").exists());

    let record: Value = reqwest::get(harness.url("/history/0"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let roles: Vec<&str> = record["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "tool"]);

    harness.stop();
}

#[tokio::test]
async fn message_surfaces_in_history_preview() {
    let dir = TempDir::new().unwrap();
    let llm = start_mock_llm(vec![]).await; // default: wait_for every round
    let harness = spawn_agent(dir.path(), llm).await;

    reqwest::Client::new()
        .post(harness.url("/message"))
        .json(&json!({"content": "find me in history", "source": "test:9"}))
        .send()
        .await
        .unwrap();

    let url = harness.url("/history");
    let found = wait_until(Duration::from_secs(10), || {
        let url = url.clone();
        async move {
            let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
            body["rounds"].as_array().unwrap().iter().any(|r| {
                r["userPreview"]
                    .as_str()
                    .map(|p| p.contains("find me in history"))
                    .unwrap_or(false)
            })
        }
    })
    .await;
    assert!(found, "posted message never surfaced in a round preview");
    harness.stop();
}

#[tokio::test]
async fn async_bash_wakes_the_agent() {
    let dir = TempDir::new().unwrap();
    // Round 1: background a short command and wait. Round 2 (woken by the
    // system:bash exit message): announce completion.
    let llm = start_mock_llm(vec![
        tool_call_response(&[
            (
                "call_1",
                "bash",
                json!({"command": "sleep 0.2 && echo DONE", "async": true}),
            ),
            ("call_2", "wait_for", json!({})),
        ]),
        tool_call_response(&[
            (
                "call_3",
                "reply",
                json!({"source": "test:1", "content": "ASYNC_COMPLETE"}),
            ),
            ("call_4", "wait_for", json!({})),
        ]),
    ])
    .await;
    let harness = spawn_agent(dir.path(), llm).await;

    reqwest::Client::new()
        .post(harness.url("/message"))
        .json(&json!({"content": "run something long", "source": "test:1"}))
        .send()
        .await
        .unwrap();

    let url = harness.url("/outbox");
    let completed = wait_until(Duration::from_secs(15), || {
        let url = url.clone();
        async move {
            let listed: Vec<Value> = reqwest::get(&url).await.unwrap().json().await.unwrap();
            listed.iter().any(|m| m["content"] == "ASYNC_COMPLETE")
        }
    })
    .await;
    assert!(completed, "job-exit wakeup never produced the follow-up reply");

    // The second round's context contains the system:bash notification.
    let ctx = std::fs::read_to_string(dir.path().join("memory/context.json")).unwrap();
    assert!(ctx.contains("[system:bash]"));
    harness.stop();
}

#[tokio::test]
async fn route_and_outbox_split_by_prefix() {
    let dir = TempDir::new().unwrap();

    // Bridge endpoint capturing deliveries.
    let received = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::<Value>::new()));
    let sink = std::sync::Arc::clone(&received);
    let bridge_app = axum::Router::new().route(
        "/hook",
        axum::routing::post(move |axum::Json(body): axum::Json<Value>| {
            let sink = std::sync::Arc::clone(&sink);
            async move {
                sink.lock().await.push(body);
                axum::Json(json!({"ok": true}))
            }
        }),
    );
    let bridge_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = bridge_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(bridge_listener, bridge_app).await.unwrap();
    });

    let llm = start_mock_llm(vec![tool_call_response(&[
        (
            "call_1",
            "reply",
            json!({"source": "bridge:s1", "content": "X"}),
        ),
        (
            "call_2",
            "reply",
            json!({"source": "other:s2", "content": "Y"}),
        ),
        ("call_3", "wait_for", json!({})),
    ])])
    .await;
    let harness = spawn_agent(dir.path(), llm).await;

    std::fs::write(
        dir.path().join("routes.json"),
        json!({"bridge": {"url": format!("http://{bridge_addr}/hook")}}).to_string(),
    )
    .unwrap();

    reqwest::Client::new()
        .post(harness.url("/message"))
        .json(&json!({"content": "fan out", "source": "bridge:s1"}))
        .send()
        .await
        .unwrap();

    let url = harness.url("/outbox");
    let settled = wait_until(Duration::from_secs(10), || {
        let url = url.clone();
        async move {
            let listed: Vec<Value> = reqwest::get(&url).await.unwrap().json().await.unwrap();
            listed.len() == 1
        }
    })
    .await;
    assert!(settled, "outbox never received the unrouted reply");

    let listed: Vec<Value> = reqwest::get(harness.url("/outbox"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed[0]["source"], "other:s2");
    assert_eq!(listed[0]["content"], "Y");

    let bridged = received.lock().await;
    assert_eq!(bridged.len(), 1);
    assert_eq!(bridged[0]["source"], "bridge:s1");
    assert_eq!(bridged[0]["content"], "X");
    harness.stop();
}

#[tokio::test]
async fn self_modified_model_shows_in_status() {
    let dir = TempDir::new().unwrap();
    // Round 1: read own config. Round 2: write it back with a new model.
    let llm = start_mock_llm(vec![
        tool_call_response(&[("call_1", "read_file", json!({"path": "agent.json"}))]),
        tool_call_response(&[
            (
                "call_2",
                "bash",
                json!({"command": r#"sed -i 's/"round"/"model": "M2", "round"/' agent.json"#}),
            ),
            (
                "call_3",
                "reply",
                json!({"source": "test:1", "content": "model switched"}),
            ),
            ("call_4", "wait_for", json!({})),
        ]),
    ])
    .await;
    let harness = spawn_agent(dir.path(), llm).await;

    reqwest::Client::new()
        .post(harness.url("/message"))
        .json(&json!({"content": "switch to M2", "source": "test:1"}))
        .send()
        .await
        .unwrap();

    let url = harness.url("/status");
    let switched = wait_until(Duration::from_secs(10), || {
        let url = url.clone();
        async move {
            let status: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
            status["model"] == "M2" && status["round"].as_u64().unwrap() >= 2
        }
    })
    .await;
    assert!(switched, "self-modified model never appeared in /status");
    harness.stop();
}
