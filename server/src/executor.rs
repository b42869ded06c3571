//! Code runs against the external execution service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use system::{ConnectionId, RunResult};

use crate::error::ExecutorError;

/// Exit code reported when the executor could not produce a result itself.
pub const FAILED_RUN_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    pub language: String,
    pub source: String,
    pub stdin: String,
    /// Capped by the dispatcher's timeout.
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub elapsed_ms: Option<u64>,
    #[serde(default)]
    pub timed_out: bool,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError>;
}

pub struct HttpExecutor {
    client: reqwest::Client,
    execute_url: String,
}

impl HttpExecutor {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            execute_url: format!("{}/execute", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
        let response = self
            .client
            .post(&self.execute_url)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<ExecutionResult>().await?)
    }
}

/// Bounds every run by a deadline and turns any failure into a run result.
#[derive(Clone)]
pub struct ExecutionDispatcher {
    executor: Arc<dyn Executor>,
    timeout: Duration,
}

impl ExecutionDispatcher {
    pub fn new(executor: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    fn timeout_for(&self, request: &ExecutionRequest) -> Duration {
        request
            .deadline
            .map_or(self.timeout, |deadline| deadline.min(self.timeout))
    }

    /// Never fails; the caller broadcasts whatever comes back.
    pub async fn dispatch(
        &self,
        session_id: &str,
        requested_by: ConnectionId,
        request: ExecutionRequest,
    ) -> RunResult {
        let timeout = self.timeout_for(&request);
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.executor.execute(&request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(result)) => RunResult {
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
                elapsed_ms: result.elapsed_ms.unwrap_or(elapsed_ms),
                timed_out: result.timed_out,
                requested_by: Some(requested_by),
            },
            Ok(Err(e)) => {
                log::warn!("Run for session {} failed: {}", session_id, e);
                failed_run(requested_by, elapsed_ms, false, format!("Execution failed: {}", e))
            }
            Err(_) => {
                log::warn!("Run for session {} timed out after {:?}", session_id, timeout);
                failed_run(
                    requested_by,
                    elapsed_ms,
                    true,
                    format!("Execution timed out after {}s", timeout.as_secs_f32()),
                )
            }
        };
        log::info!(
            "Run for session {} finished with exit code {} in {}ms",
            session_id,
            result.exit_code,
            result.elapsed_ms
        );
        result
    }
}

fn failed_run(
    requested_by: ConnectionId,
    elapsed_ms: u64,
    timed_out: bool,
    reason: String,
) -> RunResult {
    RunResult {
        exit_code: FAILED_RUN_EXIT_CODE,
        stdout: String::new(),
        stderr: reason,
        elapsed_ms,
        timed_out,
        requested_by: Some(requested_by),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct SleepingExecutor(pub Duration);

    #[async_trait]
    impl Executor for SleepingExecutor {
        async fn execute(&self, _: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
            tokio::time::sleep(self.0).await;
            Ok(ExecutionResult {
                exit_code: 0,
                stdout: "late".into(),
                stderr: String::new(),
                elapsed_ms: None,
                timed_out: false,
            })
        }
    }

    pub(crate) struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
            Ok(ExecutionResult {
                exit_code: 0,
                stdout: request.stdin.clone(),
                stderr: String::new(),
                elapsed_ms: Some(7),
                timed_out: false,
            })
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            language: "python".into(),
            source: "print(input())".into(),
            stdin: "hello".into(),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn it_synthesizes_result_on_timeout() {
        let dispatcher = ExecutionDispatcher::new(
            Arc::new(SleepingExecutor(Duration::from_secs(5))),
            Duration::from_millis(20),
        );
        let result = dispatcher.dispatch("S1", 3, request()).await;
        assert_ne!(result.exit_code, 0);
        assert!(result.timed_out);
        assert!(result.stderr.contains("timed out"));
        assert_eq!(result.requested_by, Some(3));
    }

    #[tokio::test]
    async fn it_honours_shorter_request_deadline() {
        let dispatcher = ExecutionDispatcher::new(
            Arc::new(SleepingExecutor(Duration::from_secs(5))),
            Duration::from_secs(30),
        );
        let started = Instant::now();
        let result = dispatcher
            .dispatch(
                "S1",
                3,
                ExecutionRequest {
                    deadline: Some(Duration::from_millis(20)),
                    ..request()
                },
            )
            .await;
        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn it_never_extends_configured_timeout() {
        let dispatcher = ExecutionDispatcher::new(Arc::new(EchoExecutor), Duration::from_secs(30));
        let long = ExecutionRequest {
            deadline: Some(Duration::from_secs(600)),
            ..request()
        };
        assert_eq!(dispatcher.timeout_for(&long), Duration::from_secs(30));
        assert_eq!(dispatcher.timeout_for(&request()), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn it_synthesizes_result_when_executor_unreachable() {
        let dispatcher = ExecutionDispatcher::new(
            Arc::new(HttpExecutor::new("http://127.0.0.1:9")),
            Duration::from_secs(5),
        );
        let result = dispatcher.dispatch("S1", 1, request()).await;
        assert_eq!(result.exit_code, FAILED_RUN_EXIT_CODE);
        assert!(!result.timed_out);
        assert!(result.stderr.starts_with("Execution failed"));
    }

    #[tokio::test]
    async fn it_passes_executor_result_through() {
        let dispatcher = ExecutionDispatcher::new(Arc::new(EchoExecutor), Duration::from_secs(1));
        let result = dispatcher.dispatch("S1", 1, request()).await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.elapsed_ms, 7);
    }
}
