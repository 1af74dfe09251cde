//! Reply router.
//!
//! Outbound replies are routed by source prefix: the part of the source
//! before the first `:` is looked up in `routes.json`. A hit POSTs
//! `{source, content}` to the route's URL (non-2xx is a delivery error the
//! agent sees as a tool result); a miss lands the reply in the filesystem
//! outbox for external pollers.

use std::path::Path;

use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::state::{self, OutboxMessage};
use crate::utils::now_ms;

static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client")
});

/// Where a reply ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// Delivered to a routed HTTP endpoint.
    Route(String),
    /// Written to the outbox under this id.
    Outbox(String),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Route(url) => write!(f, "delivered via route {url}"),
            Destination::Outbox(id) => write!(f, "queued in outbox ({id})"),
        }
    }
}

/// Routing key: everything before the first `:`, or the whole source.
pub fn source_prefix(source: &str) -> &str {
    source.split(':').next().unwrap_or(source)
}

/// Route `(source, content)` per `routes.json`, falling back to the outbox.
pub async fn deliver(
    workspace: &Path,
    source: &str,
    content: &str,
    metadata: Option<Value>,
) -> anyhow::Result<Destination> {
    let routes = state::load_routes(workspace).await?;
    let prefix = source_prefix(source);

    if let Some(route) = routes.get(prefix) {
        let resp = CLIENT
            .post(&route.url)
            .json(&json!({ "source": source, "content": content }))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("delivery to {} failed: {e}", route.url))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("delivery to {} failed: {status}", route.url);
        }
        debug!(prefix, url = %route.url, "reply delivered via route");
        return Ok(Destination::Route(route.url.clone()));
    }

    let msg = OutboxMessage {
        id: uuid::Uuid::new_v4().to_string(),
        source: source.to_string(),
        content: content.to_string(),
        metadata,
        timestamp: now_ms(),
    };
    state::write_outbox(workspace, &msg).await?;
    debug!(prefix, id = %msg.id, "reply queued in outbox");
    Ok(Destination::Outbox(msg.id))
}

// ── Tests ────────────────────────────────────────────────────
