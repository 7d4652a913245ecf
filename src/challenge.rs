use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

/// A coding problem. Hidden test cases are never sent to players.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default, skip_serializing)]
    pub hidden_test_cases: Vec<TestCase>,
}

impl Challenge {
    pub fn visible_inputs(&self) -> Vec<String> {
        self.test_cases.iter().map(|t| t.input.clone()).collect()
    }

    pub fn hidden_inputs(&self) -> Vec<String> {
        self.hidden_test_cases
            .iter()
            .map(|t| t.input.clone())
            .collect()
    }
}

/// Output of one input case as reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub output: String,
    #[serde(rename = "errors", default)]
    pub error: String,
    #[serde(default)]
    pub status: i64,
}

impl ExecutionResult {
    pub fn passes(&self, case: &TestCase) -> bool {
        self.error.is_empty() && self.status == 0 && self.output == case.output
    }
}

/// Number of results that match their test case position by position.
pub fn tests_passed(test_cases: &[TestCase], results: &[ExecutionResult]) -> usize {
    test_cases
        .iter()
        .zip(results)
        .filter(|(case, result)| result.passes(case))
        .count()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub code: String,
    pub language: String,
    pub results: Vec<ExecutionResult>,
    pub passed_tests: usize,
    pub date: DateTime<Utc>,
}

impl RunResult {
    pub fn new(
        code: String,
        language: String,
        test_cases: &[TestCase],
        results: Vec<ExecutionResult>,
    ) -> Self {
        let passed_tests = tests_passed(test_cases, &results);
        Self {
            code,
            language,
            results,
            passed_tests,
            date: Utc::now(),
        }
    }
}
