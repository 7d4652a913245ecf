use crate::{
    challenge::ExecutionResult,
    http::{ApiClient, ServiceError},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Code-execution sandbox.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn available_languages(&self) -> Result<Vec<String>, ServiceError>;

    /// Runs `code` once per input; results come back in input order.
    async fn run(
        &self,
        language: &str,
        code: &str,
        inputs: &[String],
    ) -> Result<Vec<ExecutionResult>, ServiceError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    message: String,
    result: Option<T>,
}

impl<T> Envelope<T> {
    fn into_result(self) -> Result<T, ServiceError> {
        if self.error {
            return Err(ServiceError::Remote(self.message));
        }
        self.result
            .ok_or_else(|| ServiceError::Malformed("missing result".into()))
    }
}

#[derive(Debug, Deserialize)]
struct Languages {
    languages: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    language: &'a str,
    code: &'a str,
    input: &'a [String],
}

#[derive(Debug, Clone)]
pub struct HttpRunner {
    client: ApiClient,
}

impl HttpRunner {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Runner for HttpRunner {
    async fn available_languages(&self) -> Result<Vec<String>, ServiceError> {
        let envelope: Envelope<Languages> = self.client.get("/api/v1/languages").await?;
        Ok(envelope.into_result()?.languages)
    }

    async fn run(
        &self,
        language: &str,
        code: &str,
        inputs: &[String],
    ) -> Result<Vec<ExecutionResult>, ServiceError> {
        let request = RunRequest {
            language,
            code,
            input: inputs,
        };
        let envelope: Envelope<Vec<ExecutionResult>> =
            self.client.post("/api/v1/run", &request).await?.json().await?;
        let results = envelope.into_result()?;
        if results.len() != inputs.len() {
            return Err(ServiceError::Malformed(format!(
                "expected {} results, got {}",
                inputs.len(),
                results.len()
            )));
        }
        Ok(results)
    }
}
