use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use burrow::agent::{new_status, Agent};
use burrow::comm::MessageQueue;
use burrow::gateway;
use burrow::jobs::JobRegistry;
use burrow::workspace::{self, ROLE_ROOT, ROLE_WORKER};

#[derive(Parser, Debug)]
#[command(name = "burrow", version, about = "Persistent, self-modifying agent runtime")]
struct Cli {
    /// Agent workspace directory (created and seeded on first run)
    #[arg(default_value = "./workspace")]
    workspace: PathBuf,
}

#[tokio::main]
async fn main() {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("burrow=info,tower_http=warn"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let cli = Cli::parse();
    let workspace_path = cli.workspace;

    // Root role is elected by the launcher; consume the variable so
    // children spawned from this process don't inherit it.
    let is_root = std::env::var("SPAWN_WORKER").as_deref() == Ok("true");
    if is_root {
        std::env::remove_var("SPAWN_WORKER");
    }

    // Unhandled panics anywhere in the process become crash records.
    {
        let ws = workspace_path.clone();
        std::panic::set_hook(Box::new(move |info| {
            let message = info.to_string();
            workspace::append_crash(&ws, "unknown", &message, &message);
            eprintln!("fatal panic: {message}");
            std::process::exit(1);
        }));
    }

    match run(workspace_path.clone(), is_root).await {
        Ok(()) => {
            info!("agent stopped cleanly");
        }
        Err(e) => {
            error!(error = ?e, "fatal error");
            workspace::append_crash(
                &workspace_path,
                "unknown",
                &e.to_string(),
                &format!("{e:?}"),
            );
            std::process::exit(1);
        }
    }
}

async fn run(workspace_path: PathBuf, is_root: bool) -> anyhow::Result<()> {
    let role = if is_root { ROLE_ROOT } else { ROLE_WORKER };
    workspace::init(&workspace_path, role).await?;
    let workspace_path = workspace_path
        .canonicalize()
        .context("resolve workspace path")?;

    // Informational, for anything this agent launches.
    std::env::set_var("WORKSPACE", &workspace_path);

    if !is_root {
        workspace::reset_inherited_root_state(&workspace_path).await?;
    }
    workspace::run_skill_setups(&workspace_path).await;

    let queue = Arc::new(MessageQueue::new());
    let jobs = Arc::new(JobRegistry::new(Arc::clone(&queue)));
    let status = new_status();

    workspace::inject_boot_message(&workspace_path, &queue, is_root).await;

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let server = gateway::start_server(
        addr,
        workspace_path.clone(),
        Arc::clone(&queue),
        Arc::clone(&status),
    )
    .await
    .with_context(|| format!("bind http surface on {addr}"))?;

    info!(
        role,
        addr = %server.addr,
        workspace = %workspace_path.display(),
        "burrow ready"
    );

    let mut agent = Agent::new(workspace_path, queue, jobs, status);
    let result = tokio::select! {
        res = agent.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down");
            Ok(())
        }
    };
    server.handle.abort();
    result
}
