//! The `/judge` transport: an axum WebSocket endpoint that hands each
//! connection its own [`Session`], reading one text frame at a time and
//! writing back whatever the session produces.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use judge::RuntimeRegistry;
use sandbox::SandboxProvisioner;

use crate::config::EngineConfig;
use crate::session::{Outcome, Session};

/// Grace period a connection is given to send its `init` before the
/// transport gives up on it (recommended 1–5s).
const INIT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Everything a `/judge` connection needs, shared across the whole process.
pub struct AppState {
    pub registry: RuntimeRegistry,
    pub provisioner: SandboxProvisioner,
    pub config: EngineConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/judge", get(upgrade)).with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut session = Session::new(&state.registry, &state.provisioner, &state.config);

    loop {
        // The grace period applies for as long as the session is still
        // waiting on its `init` (`Session::init_timed_out`) — not just on
        // the very first frame, so a pre-`init` message that doesn't itself
        // complete `init` (e.g. an unrecognized `type`) doesn't silently
        // disarm the timeout for the rest of the connection.
        let next = if session.init_timed_out() {
            match tokio::time::timeout(INIT_GRACE_PERIOD, socket.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    log::info!("session closed: no init received within the grace period");
                    send_close(&mut socket, 4001, "init timeout").await;
                    session.cleanup().await;
                    return;
                }
            }
        } else {
            socket.recv().await
        };

        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                log::debug!("session transport closed; running cleanup");
                session.cleanup().await;
                return;
            }
            Some(Ok(_)) => {
                // Ping/Pong/Binary frames carry no protocol meaning here.
                continue;
            }
            Some(Err(e)) => {
                log::warn!("session transport error, treating as disconnect: {}", e);
                session.cleanup().await;
                return;
            }
        };

        let (outbound, outcome) = session.handle_frame(&text).await;
        for frame in outbound {
            if socket.send(Message::Text(frame.to_frame())).await.is_err() {
                log::warn!("failed to write outbound frame; treating as disconnect");
                session.cleanup().await;
                return;
            }
        }

        match outcome {
            Outcome::Continue => continue,
            Outcome::Close(code) => {
                send_close(&mut socket, code, close_reason(code)).await;
                session.cleanup().await;
                return;
            }
        }
    }
}

async fn send_close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Human-readable close reasons. Reason strings are not part of the contract
/// surface — only the numeric code is — so these exist purely for operators
/// reading a close frame off the wire.
fn close_reason(code: u16) -> &'static str {
    match code {
        4000 => "already initialized",
        4001 => "init timeout",
        4002 => "validation or setup error",
        4003 => "not yet initialized",
        4006 => "compile failed",
        4999 => "session completed",
        _ => "closed",
    }
}

/// Bind and serve the `/judge` endpoint until the given shutdown signal
/// resolves.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    log::info!("judge engine listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}
