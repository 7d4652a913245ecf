//! One player's websocket connection bound to a lobby: forwards decoded
//! packets to the engine and drains the player's outbox to the socket.

use crate::{
    auth::AuthError,
    engine::LobbyHandle,
    lobby::{LobbyError, UserId, OUTBOX_CAPACITY},
    packets,
};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Close codes used by the lobby protocol.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TIMEOUT: u16 = 4400;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const FORBIDDEN: u16 = 4403;
    pub const NOT_FOUND: u16 = 4404;
}

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Why an entry point refused a connection.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("lobby not found")]
    NotFound,
    #[error("{0}")]
    Forbidden(LobbyError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    pub fn close_code(&self) -> u16 {
        match self {
            AdmissionError::Unauthorized(AuthError::Unavailable(_)) => close_code::INTERNAL_ERROR,
            AdmissionError::Unauthorized(_) => close_code::UNAUTHORIZED,
            AdmissionError::NotFound => close_code::NOT_FOUND,
            AdmissionError::Forbidden(_) => close_code::FORBIDDEN,
            AdmissionError::Internal(_) => close_code::INTERNAL_ERROR,
        }
    }
}

impl From<LobbyError> for AdmissionError {
    fn from(error: LobbyError) -> Self {
        match error {
            LobbyError::Closed => AdmissionError::NotFound,
            other => AdmissionError::Forbidden(other),
        }
    }
}

fn close_frame(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Why the read side of a session gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadFailure {
    Idle,
    Transport,
}

impl ReadFailure {
    fn close_frame(self) -> Message {
        match self {
            ReadFailure::Idle => close_frame(close_code::TIMEOUT, "connection timed out".into()),
            ReadFailure::Transport => {
                close_frame(close_code::INTERNAL_ERROR, "connection error".into())
            }
        }
    }
}

/// Completes the upgrade only to tell the client why it was refused.
pub async fn reject(mut socket: WebSocket, error: &AdmissionError) {
    debug!(code = error.close_code(), "connection refused: {error}");
    let _ = socket
        .send(close_frame(error.close_code(), error.to_string()))
        .await;
    let _ = socket.close().await;
}

/// Runs the connection of `user` until either side hangs up.
///
/// Once connected the engine holds the only strong outbox sender, so
/// dropping it (lobby closed, kicked, too far behind) ends the writer.
pub async fn run(socket: WebSocket, lobby: LobbyHandle, user: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
    let weak = outbox.downgrade();

    let writer = tokio::spawn(async move {
        let mut outgoing = ReceiverStream::new(rx);
        let mut ping = time::interval_at(time::Instant::now() + PING_PERIOD, PING_PERIOD);
        loop {
            let message = tokio::select! {
                message = outgoing.next() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = ping.tick() => Message::Ping(Vec::new()),
            };
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if let Err(e) = lobby.connect(user, outbox.clone()).await {
        let error = AdmissionError::from(e);
        let _ = outbox.try_send(close_frame(error.close_code(), error.to_string()));
        drop(outbox);
        let _ = writer.await;
        return;
    }
    drop(outbox);
    info!(lobby = %lobby.id(), user, "player connected");

    loop {
        let message = match time::timeout(IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(lobby = %lobby.id(), user, "read failed: {e}");
                if let Some(outbox) = weak.upgrade() {
                    let _ = outbox.try_send(ReadFailure::Transport.close_frame());
                }
                break;
            }
            Err(_) => {
                if let Some(outbox) = weak.upgrade() {
                    let _ = outbox.try_send(ReadFailure::Idle.close_frame());
                }
                break;
            }
        };

        let bytes = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match packets::decode(&bytes) {
            Ok(packet) => {
                if lobby.dispatch(user, packet).is_err() {
                    break;
                }
            }
            Err(e) => warn!(lobby = %lobby.id(), user, "protocol error: {e}"),
        }
    }

    info!(lobby = %lobby.id(), user, "player disconnected");
    if let Some(outbox) = weak.upgrade() {
        lobby.disconnect(user, outbox);
    }
    let _ = writer.await;
}
