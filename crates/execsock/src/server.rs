//! WebSocket transport
//!
//! `GET /ws` upgrades to a session; every text frame is one client message
//! and every server message goes out as one text frame. `GET /health`
//! reports readiness.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::runner::Runner;
use crate::session::{
    PromptDetector, ServerMessage, Session, SessionGuard, SessionRegistry, detector_for,
};

/// Frames buffered from the client before the session reads them
const INBOUND_CAPACITY: usize = 32;

/// Messages buffered for the client before the session waits
const OUTBOUND_CAPACITY: usize = 256;

/// How long shutdown waits for sessions to clean up
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// State shared by all connections
#[derive(Debug, Clone)]
pub struct AppState {
    pub runner: Runner,
    pub registry: SessionRegistry,
    pub detector: Arc<dyn PromptDetector>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = SessionRegistry::new(config.max_sessions);
        let detector = detector_for(config.prompt_detection);
        Self {
            runner: Runner::new(config),
            registry,
            detector,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub version: &'static str,
    /// Open sessions
    pub sessions: usize,
    /// Sessions with an execution in flight
    pub executing: usize,
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(upgrade))
        .with_state(state)
}

/// Serve connections until `shutdown` resolves
///
/// On shutdown, live sessions are told to stop and given a grace period to
/// kill their processes and purge their artifacts.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }

    let registry = state.registry.clone();
    let stopping = registry.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            stopping.shutdown();
        })
        .await?;

    if tokio::time::timeout(SHUTDOWN_GRACE, registry.wait_idle())
        .await
        .is_err()
    {
        warn!(remaining = registry.len(), "sessions still open after shutdown grace");
    }
    info!("server stopped");
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = state.registry.snapshot();
    Json(HealthResponse {
        status: "ok",
        message: "Code execution server running",
        version: env!("CARGO_PKG_VERSION"),
        sessions: sessions.len(),
        executing: sessions.iter().filter(|s| s.state.is_active()).count(),
    })
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let guard = match state.registry.open() {
        Ok(guard) => guard,
        Err(e) => {
            warn!(error = %e, "refusing connection");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, guard))
}

async fn handle_socket(socket: WebSocket, state: AppState, guard: SessionGuard) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let session = Session::new(guard, state.runner, state.detector, outbound_tx);

    // Ends once the session drops its sender or the socket fails
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(message.to_json().into())).await {
                debug!(error = %e, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                // Binary frames are not part of the protocol; ping/pong is
                // answered by the transport
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    break;
                }
            }
        }
    });

    session.run(inbound_rx).await;

    reader.abort();
    if let Err(e) = writer.await {
        warn!(error = %e, "websocket writer failed");
    }
}
