//! waker server - HTTP surface and periodic trigger for one agent instance.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use waker::bootstrap::open_project;
use waker::io::config::StoreKind;
use waker::looping::run_loop;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "waker-server")]
#[command(about = "HTTP status, enqueue and trigger surface for a waker agent")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Project directory (contains .waker/)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Only wake on POST /api/wake
    #[arg(long)]
    no_timer: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    waker::logging::init("waker_server=info,waker=info");

    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    info!(project_dir = %project_dir.display(), "starting waker-server");

    let project = open_project(&project_dir)?;
    let document_dir = match project.config.store.kind {
        StoreKind::File => Some(
            project
                .config
                .store_dir(&project_dir)
                .join(&project.config.agent_id),
        ),
        StoreKind::Memory => None,
    };
    let interval = project.config.wake_interval();
    let state = AppState::new(project.orchestrator, document_dir);

    sse::start_file_watcher(state.clone());
    let timer = (!args.no_timer).then(|| start_timer(state.clone(), interval));

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    if let Some(timer) = timer {
        timer.abort();
    }
    Ok(())
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state)
}

/// Wake every `interval` in the background, broadcasting each outcome.
fn start_timer(state: AppState, interval: Duration) -> tokio::task::JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "starting wake timer");
    tokio::spawn(async move {
        let orchestrator = state.orchestrator.clone();
        run_loop(
            &orchestrator,
            interval,
            None,
            std::future::pending(),
            |result| routes::publish_cycle(&state, result),
        )
        .await;
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use waker::io::memory_store::InMemoryStateStore;
    use waker::io::ports::PortRegistry;
    use waker::orchestrator::Orchestrator;
    use waker::test_support::test_cycle_config;

    use super::*;

    async fn serve() -> SocketAddr {
        let state = AppState::new(
            Orchestrator::new(
                Arc::new(InMemoryStateStore::new("agent")),
                PortRegistry::new(),
                test_cycle_config(),
            ),
            None,
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app(state)).await;
        });
        addr
    }

    /// Send one HTTP/1.1 request and return (status, body).
    async fn send(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.expect("read");
        let status = raw
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status line");
        let body = raw
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        (status, body)
    }

    #[tokio::test]
    async fn serves_health_status_and_enqueue() {
        let addr = serve().await;

        let (status, body) = send(addr, "GET", "/api/health", "").await;
        assert_eq!((status, body.as_str()), (200, "ok"));

        let (status, body) = send(
            addr,
            "POST",
            "/api/tasks",
            r#"{"name": "sync earnings", "priority": "high"}"#,
        )
        .await;
        assert_eq!(status, 201);
        assert!(body.contains("\"id\":\"task-"));

        let (status, body) = send(addr, "GET", "/api/status", "").await;
        assert_eq!(status, 200);
        assert!(body.contains("\"pending\":1"));
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let addr = serve().await;
        let (status, _) = send(addr, "POST", "/api/tasks", "{not json").await;
        assert_eq!(status, 400);

        let (status, _) = send(addr, "POST", "/api/tasks", r#"{"description": "no name"}"#).await;
        assert_eq!(status, 400);
    }
}
