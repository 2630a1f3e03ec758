//! `kiln dev` command implementation.
//!
//! Builds once, then serves the latest build from memory while a watcher
//! drives incremental rebuilds:
//!
//! ```text
//! file change -> SourceWatcher -> DevSession::run (debounced rebuild)
//!             -> LiveUpdate broadcast -> /__kiln/ws clients
//! ```
//!
//! Nothing is written to the output directory in this mode.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use kiln_core::dev::{SourceWatcher, WatchOptions, CLIENT_RUNTIME};
use kiln_core::emit::HTML_FILE;
use kiln_core::{BuildConfig, Bundler, DevSession, Mode};
use miette::{IntoDiagnostic, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Script tag that loads the live-update client.
const CLIENT_TAG: &str = "<script src=\"/__kiln/client.js\"></script>";

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    /// Working directory.
    pub cwd: PathBuf,
    /// Port to listen on (overrides config).
    pub port: Option<u16>,
    /// Host to bind to (overrides config).
    pub host: Option<String>,
    /// Open browser automatically.
    pub open: bool,
    pub mode: Mode,
    /// Explicit config file path.
    pub config: Option<PathBuf>,
}

/// Shared server state.
#[derive(Clone)]
struct AppState {
    session: Arc<DevSession>,
    /// Flips to `true` on shutdown so open sockets close.
    shutdown: watch::Receiver<bool>,
}

/// Run the dev server until Ctrl-C.
pub async fn run(action: DevAction) -> Result<()> {
    if action.mode != Mode::Development {
        return Err(miette::miette!(
            code = "CONFIG_ERROR",
            "the dev server only runs in development mode (got {})",
            action.mode.as_str()
        ));
    }

    let mut config = BuildConfig::load(&action.cwd, action.config.as_deref())
        .map_err(to_report)?
        .with_mode(Mode::Development);
    if let Some(port) = action.port {
        config.server.port = port;
    }
    if let Some(host) = action.host {
        config.server.host = host;
    }
    let server = config.server.clone();
    let root = config.root.clone();
    let output = config.output_path();

    let session = Arc::new(DevSession::new(Bundler::new(config).map_err(to_report)?));

    // Initial build: failure here is fatal
    let initial = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || session.start())
            .await
            .into_diagnostic()?
            .map_err(to_report)?
    };
    info!(
        modules = initial.graph.len(),
        artifacts = initial.snapshot.len(),
        "initial build ready"
    );

    // Watcher -> session
    let (change_tx, change_rx) = mpsc::unbounded_channel();
    let watcher = tokio::task::spawn_blocking(move || {
        SourceWatcher::spawn(WatchOptions::new(root).ignore(output), change_tx)
    })
    .await
    .into_diagnostic()?
    .map_err(to_report)?;
    let rebuild_loop = tokio::spawn(
        Arc::clone(&session).run(change_rx, Duration::from_millis(server.debounce_ms)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = router(AppState {
        session: Arc::clone(&session),
        shutdown: shutdown_rx,
    });

    let host_ip = if server.host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        server.host.clone()
    };
    let addr: SocketAddr = format!("{host_ip}:{}", server.port)
        .parse()
        .into_diagnostic()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        miette::miette!(code = "SERVER_ERROR", "failed to bind {addr}: {e}")
    })?;

    println!();
    println!("  Dev server running at http://{}:{}", server.host, server.port);
    println!("  Watching with {:?} backend", watcher.backend());
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    if action.open {
        let url = format!("http://{}:{}", server.host, server.port);
        if let Err(e) = open_browser(&url) {
            warn!(error = %e, "failed to open browser");
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await
        .into_diagnostic()?;

    // Dropping the watcher closes the change channel, which ends the loop
    watcher.stop();
    let _ = rebuild_loop.await;
    session.stop();
    Ok(())
}

fn to_report(e: kiln_core::Error) -> miette::Report {
    miette::miette!(code = e.code(), "{}", e)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/__kiln/client.js", get(serve_client))
        .route("/__kiln/ws", get(live_websocket))
        .route("/__kiln/status", get(serve_status))
        .route("/*path", get(serve_artifact))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Serve the HTML shell with the live-update client injected.
async fn serve_index(State(state): State<AppState>) -> Response {
    let Some(snapshot) = state.session.snapshot() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "build in progress").into_response();
    };
    let Some(html) = snapshot.html() else {
        return (StatusCode::NOT_FOUND, "no html shell").into_response();
    };
    let html = inject_client(&String::from_utf8_lossy(&html.bytes));
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        html,
    )
        .into_response()
}

async fn serve_client() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/javascript; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        CLIENT_RUNTIME,
    )
}

async fn serve_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.session.status())
}

/// Serve an artifact of the current snapshot by filename.
///
/// Paths without an extension fall back to the HTML shell so client-side
/// routes survive a refresh.
async fn serve_artifact(State(state): State<AppState>, AxumPath(path): AxumPath<String>) -> Response {
    if path == HTML_FILE {
        return serve_index(State(state)).await;
    }
    let Some(snapshot) = state.session.snapshot() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "build in progress").into_response();
    };
    match snapshot.get(&path) {
        Some(artifact) => (
            [
                (header::CONTENT_TYPE, artifact.content_type()),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            artifact.bytes.to_vec(),
        )
            .into_response(),
        None if !path.rsplit('/').next().unwrap_or("").contains('.') => {
            serve_index(State(state)).await
        }
        None => {
            debug!(path = %path, "not found");
            (StatusCode::NOT_FOUND, format!("Not found: /{path}")).into_response()
        }
    }
}

/// Insert the client script before `</body>`, or append it.
fn inject_client(html: &str) -> String {
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(at) => format!("{}{CLIENT_TAG}{}", &html[..at], &html[at..]),
        None => format!("{html}{CLIENT_TAG}"),
    }
}

// ============================================================================
// WebSocket live updates
// ============================================================================

async fn live_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_live_socket(socket, state))
}

/// Forward live updates to one client.
///
/// A client that falls behind the broadcast queue is disconnected; the
/// client runtime reconnects and reloads if it missed a build.
async fn handle_live_socket(socket: WebSocket, state: AppState) {
    let mut updates = state.session.subscribe();
    let mut shutdown = state.shutdown.clone();
    let (mut sender, mut receiver) = socket.split();

    if sender
        .send(Message::Text(state.session.greeting().to_json()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    if sender.send(Message::Text(update.to_json())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "live-update client lagging, disconnecting");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = shutdown.changed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Open a URL in the default browser.
fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", url])
            .spawn()?;
    }
    Ok(())
}
