use crate::{backend::Backend, engine::LobbyHandle, state::LobbyRegistry};
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{self, Instant},
};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EndCause {
    TimeUp,
    AllSubmitted,
}

/// One-shot signal that ends a round. The first `fire` wins; later calls
/// leave the recorded cause untouched.
#[derive(Debug, Clone)]
pub struct RoundCancel {
    tx: Arc<watch::Sender<Option<EndCause>>>,
}

impl Default for RoundCancel {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundCancel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true if this call ended the round.
    pub fn fire(&self, cause: EndCause) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    pub fn cause(&self) -> Option<EndCause> {
        *self.tx.borrow()
    }

    pub fn is_fired(&self) -> bool {
        self.cause().is_some()
    }

    /// Resolves once the signal has fired.
    pub async fn fired(&self) -> EndCause {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(cause) = current {
                return cause;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Runs one round to completion: waits for the deadline or the cancel
/// signal, retires the lobby, then tells the backend the match is over.
pub(crate) async fn orchestrate(
    lobby: LobbyHandle,
    registry: LobbyRegistry,
    backend: Arc<dyn Backend>,
    deadline: Instant,
    cancel: RoundCancel,
) {
    tokio::select! {
        _ = time::sleep_until(deadline) => {
            cancel.fire(EndCause::TimeUp);
        }
        _ = cancel.fired() => {}
    }
    let cause = cancel.cause().unwrap_or(EndCause::TimeUp);
    info!(lobby = %lobby.id(), ?cause, "round over");

    registry.remove(&lobby.id());
    lobby.end_round(cause);

    if let Err(e) = backend.end_match(lobby.id()).await {
        warn!(lobby = %lobby.id(), "failed to report end of match: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fire_wins() {
        let cancel = RoundCancel::new();
        assert!(!cancel.is_fired());
        assert!(cancel.fire(EndCause::AllSubmitted));
        assert!(!cancel.fire(EndCause::TimeUp));
        assert_eq!(cancel.cause(), Some(EndCause::AllSubmitted));
    }

    #[test]
    fn clones_share_the_signal() {
        let cancel = RoundCancel::new();
        let other = cancel.clone();
        assert!(other.fire(EndCause::TimeUp));
        assert!(!cancel.fire(EndCause::AllSubmitted));
        assert_eq!(cancel.cause(), Some(EndCause::TimeUp));
    }

    #[tokio::test]
    async fn fired_wakes_waiters() {
        let cancel = RoundCancel::new();
        let waiter = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.fired().await }
        });
        tokio::task::yield_now().await;
        cancel.fire(EndCause::AllSubmitted);
        assert_eq!(waiter.await.unwrap(), EndCause::AllSubmitted);
    }

    #[tokio::test]
    async fn fired_returns_immediately_when_already_fired() {
        let cancel = RoundCancel::new();
        cancel.fire(EndCause::TimeUp);
        assert_eq!(cancel.fired().await, EndCause::TimeUp);
    }
}
