use crate::{
    challenge::{Challenge, RunResult, TestCase},
    http::{ApiClient, ServiceError},
    lobby::UserId,
};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::json;
use std::sync::{Mutex, PoisonError};
use tracing::info;
use uuid::Uuid;

/// Match row created when a round starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub unique_id: Uuid,
    pub owner_id: UserId,
    pub users: Vec<UserId>,
    pub challenge_id: i64,
    pub mode_id: i64,
    pub ended: bool,
    pub max_players: usize,
    pub allowed_languages: String,
    /// Seconds.
    pub game_duration: u64,
}

/// Challenge storage and match-result persistence.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_match(&self, record: &MatchRecord) -> Result<(), ServiceError>;

    async fn register_submission(
        &self,
        lobby: Uuid,
        user: UserId,
        result: &RunResult,
    ) -> Result<(), ServiceError>;

    async fn end_match(&self, lobby: Uuid) -> Result<(), ServiceError>;

    async fn random_challenge(&self) -> Result<Challenge, ServiceError>;

    async fn challenge(&self, id: i64) -> Result<Challenge, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: ApiClient,
}

impl HttpBackend {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_match(&self, record: &MatchRecord) -> Result<(), ServiceError> {
        self.client.post("/v1/game", record).await?;
        Ok(())
    }

    async fn register_submission(
        &self,
        lobby: Uuid,
        user: UserId,
        result: &RunResult,
    ) -> Result<(), ServiceError> {
        let body = json!({
            "userId": user,
            "gameId": lobby,
            "code": result.code,
            "language": result.language,
            "testsPassed": result.passed_tests,
            "submittedAt": result.date.to_rfc3339(),
        });
        self.client
            .patch(&format!("/v1/game/{lobby}/submit"), &body)
            .await?;
        Ok(())
    }

    async fn end_match(&self, lobby: Uuid) -> Result<(), ServiceError> {
        self.client
            .patch(&format!("/v1/game/{lobby}/endgame"), &json!({}))
            .await?;
        Ok(())
    }

    async fn random_challenge(&self) -> Result<Challenge, ServiceError> {
        self.client.get("/v1/challenge/random").await
    }

    async fn challenge(&self, id: i64) -> Result<Challenge, ServiceError> {
        self.client.get(&format!("/v1/challenge/{id}")).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    MatchCreated(MatchRecord),
    Submission {
        lobby: Uuid,
        user: UserId,
        passed_tests: usize,
    },
    MatchEnded(Uuid),
}

/// In-process backend serving a fixed challenge set. Persistence calls are
/// logged and kept as events.
#[derive(Debug)]
pub struct LocalBackend {
    challenges: Vec<Challenge>,
    events: Mutex<Vec<BackendEvent>>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(builtin_challenges())
    }
}

impl LocalBackend {
    pub fn new(challenges: Vec<Challenge>) -> Self {
        Self {
            challenges,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn ended_matches(&self) -> Vec<Uuid> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BackendEvent::MatchEnded(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: BackendEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn create_match(&self, record: &MatchRecord) -> Result<(), ServiceError> {
        info!(lobby = %record.unique_id, challenge = record.challenge_id, "match created");
        self.record(BackendEvent::MatchCreated(record.clone()));
        Ok(())
    }

    async fn register_submission(
        &self,
        lobby: Uuid,
        user: UserId,
        result: &RunResult,
    ) -> Result<(), ServiceError> {
        info!(%lobby, user, passed = result.passed_tests, "submission registered");
        self.record(BackendEvent::Submission {
            lobby,
            user,
            passed_tests: result.passed_tests,
        });
        Ok(())
    }

    async fn end_match(&self, lobby: Uuid) -> Result<(), ServiceError> {
        info!(%lobby, "match ended");
        self.record(BackendEvent::MatchEnded(lobby));
        Ok(())
    }

    async fn random_challenge(&self) -> Result<Challenge, ServiceError> {
        self.challenges
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| ServiceError::Remote("no challenges available".into()))
    }

    async fn challenge(&self, id: i64) -> Result<Challenge, ServiceError> {
        self.challenges
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::Remote(format!("challenge {id} not found")))
    }
}

pub fn builtin_challenges() -> Vec<Challenge> {
    vec![
        Challenge {
            id: 1,
            title: "Add Two Numbers".into(),
            description: "Read two integers separated by a space and print their sum.".into(),
            test_cases: vec![
                TestCase::new("1 2", "3"),
                TestCase::new("3 4", "7"),
                TestCase::new("5 6", "11"),
            ],
            hidden_test_cases: vec![
                TestCase::new("100 1", "101"),
                TestCase::new("-4 4", "0"),
            ],
        },
        Challenge {
            id: 2,
            title: "Reverse a Word".into(),
            description: "Print the input word reversed.".into(),
            test_cases: vec![TestCase::new("abc", "cba"), TestCase::new("duel", "leud")],
            hidden_test_cases: vec![
                TestCase::new("racecar", "racecar"),
                TestCase::new("rust", "tsur"),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_backend_looks_up_challenges() {
        let backend = LocalBackend::default();
        assert_eq!(backend.challenge(2).await.unwrap().title, "Reverse a Word");
        assert!(backend.challenge(99).await.is_err());
        assert!(backend.random_challenge().await.is_ok());
    }

    #[tokio::test]
    async fn empty_local_backend_cannot_pick_a_challenge() {
        let backend = LocalBackend::new(Vec::new());
        assert!(matches!(
            backend.random_challenge().await,
            Err(ServiceError::Remote(_))
        ));
    }

    #[test]
    fn match_record_uses_camel_case() {
        let record = MatchRecord {
            unique_id: Uuid::nil(),
            owner_id: 1,
            users: vec![1, 2],
            challenge_id: 3,
            mode_id: 1,
            ended: false,
            max_players: 8,
            allowed_languages: "python,typescript".into(),
            game_duration: 900,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["ownerId"], 1);
        assert_eq!(value["allowedLanguages"], "python,typescript");
        assert_eq!(value["gameDuration"], 900);
    }
}
