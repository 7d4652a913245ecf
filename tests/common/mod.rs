#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::ws::Message;
use codeduel_lobby::{
    backend::LocalBackend,
    challenge::{Challenge, ExecutionResult, TestCase},
    engine::LobbyHandle,
    http::ServiceError,
    lobby::{Outbox, Profile, UserId, OUTBOX_CAPACITY},
    runner::Runner,
    state::{LobbyRegistry, Services},
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver};
use tokio::time::{timeout, Duration};

/// Understands three programs: `sum` adds the numbers of its input, `echo`
/// prints the input back, `crash` makes the runner itself fail.
#[derive(Debug, Default)]
pub struct FakeRunner;

#[async_trait]
impl Runner for FakeRunner {
    async fn available_languages(&self) -> Result<Vec<String>, ServiceError> {
        Ok(vec!["python".into(), "typescript".into(), "rust".into()])
    }

    async fn run(
        &self,
        _language: &str,
        code: &str,
        inputs: &[String],
    ) -> Result<Vec<ExecutionResult>, ServiceError> {
        let output = |input: &String| match code {
            "sum" => input
                .split_whitespace()
                .filter_map(|n| n.parse::<i64>().ok())
                .sum::<i64>()
                .to_string(),
            _ => input.clone(),
        };
        match code {
            "crash" => Err(ServiceError::Remote("sandbox unavailable".into())),
            _ => Ok(inputs
                .iter()
                .map(|input| ExecutionResult {
                    output: output(input),
                    error: String::new(),
                    status: 0,
                })
                .collect()),
        }
    }
}

pub fn sum_challenge() -> Challenge {
    Challenge {
        id: 42,
        title: "Sum".into(),
        description: "Add the numbers.".into(),
        test_cases: vec![TestCase::new("1 2", "3"), TestCase::new("3 4", "7")],
        hidden_test_cases: vec![
            TestCase::new("100 1", "101"),
            TestCase::new("-4 4", "0"),
            TestCase::new("5 5", "10"),
        ],
    }
}

pub fn profile(id: UserId) -> Profile {
    Profile {
        id,
        username: format!("player{id}"),
        email: format!("player{id}@example.com"),
        avatar: String::new(),
    }
}

pub struct Harness {
    pub registry: LobbyRegistry,
    pub backend: Arc<LocalBackend>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        let backend = Arc::new(LocalBackend::new(vec![sum_challenge()]));
        let services = Services {
            backend: backend.clone(),
            runner: Arc::new(FakeRunner),
        };
        Self {
            registry: LobbyRegistry::new(),
            backend,
            services,
        }
    }

    pub fn create(&self, owner: UserId) -> LobbyHandle {
        self.registry
            .create(profile(owner), self.services.clone())
            .unwrap()
    }

    /// Waits for the backend to have seen `count` end-of-match reports.
    pub async fn wait_for_ended(&self, count: usize) {
        for _ in 0..100 {
            if self.backend.ended_matches().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backend saw {:?}", self.backend.events());
    }
}

pub struct Player {
    pub id: UserId,
    pub outbox: Outbox,
    rx: Receiver<Message>,
}

impl Player {
    pub async fn connect(lobby: &LobbyHandle, id: UserId) -> Self {
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        lobby.connect(id, outbox.clone()).await.unwrap();
        let mut player = Self { id, outbox, rx };
        assert_eq!(player.next().await["type"], "lobby");
        player
    }

    async fn message(&mut self) -> Message {
        timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("outbox closed")
    }

    /// Next packet; panics on a close frame.
    pub async fn next(&mut self) -> Value {
        match self.message().await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a packet, got {other:?}"),
        }
    }

    /// Skips packets until one of the given kind arrives.
    pub async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let packet = self.next().await;
            if packet["type"] == kind {
                return packet;
            }
        }
    }

    /// Skips packets until the connection is closed, returning code and reason.
    pub async fn closed(&mut self) -> (u16, String) {
        loop {
            if let Message::Close(frame) = self.message().await {
                let frame = frame.expect("close without a frame");
                return (frame.code, frame.reason.into_owned());
            }
        }
    }

    pub fn is_idle(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}
