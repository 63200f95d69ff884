use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use exapatch_core::config::PatchConfig;
use exapatch_core::error::{ErrorCode, PatchError, patch_error};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Default number of tasks allowed to run at once.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// Per-node outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// The task's own time box elapsed.
    TimedOut,
}

/// Entry appended to the shared collector by each task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub node: String,
    pub status: TaskStatus,
    pub error_code: Option<ErrorCode>,
    pub detail: Option<String>,
}

/// Result of one parallel run.
///
/// When `killed` is set the join deadline elapsed with tasks outstanding;
/// nodes without an entry in `results` must be treated as unknown.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub label: String,
    pub nodes: Vec<String>,
    pub results: Vec<TaskResult>,
    pub killed: bool,
}

impl RunReport {
    pub fn result_for(&self, node: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.node == node)
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.status == TaskStatus::Succeeded)
            .map(|r| r.node.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&TaskResult> {
        self.results
            .iter()
            .filter(|r| r.status != TaskStatus::Succeeded)
            .collect()
    }

    /// Nodes with no collected result.
    pub fn unknown(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.result_for(n).is_none())
            .map(String::as_str)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        !self.killed && self.unknown().is_empty() && self.failed().is_empty()
    }

    /// Convert into an error for the caller's step.
    ///
    /// A killed run is always `ParallelCheckTimedOut`. Otherwise the first
    /// failing task's code wins, falling back to `failure_code`.
    pub fn check(&self, failure_code: ErrorCode) -> Result<()> {
        if self.killed {
            return Err(patch_error(
                ErrorCode::ParallelCheckTimedOut,
                format!(
                    "{} timed out before all nodes reported; unknown: {}",
                    self.label,
                    self.unknown().join(", ")
                ),
            ));
        }
        let failed = self.failed();
        if let Some(first) = failed.first() {
            let nodes: Vec<&str> = failed.iter().map(|r| r.node.as_str()).collect();
            let code = first.error_code.unwrap_or(failure_code);
            let detail = first.detail.clone().unwrap_or_default();
            return Err(PatchError::new(
                code,
                format!("{} failed on {}: {}", self.label, nodes.join(", "), detail),
            )
            .into());
        }
        let unknown = self.unknown();
        if !unknown.is_empty() {
            return Err(patch_error(
                ErrorCode::ParallelCheckTimedOut,
                format!("{} has no result for {}", self.label, unknown.join(", ")),
            ));
        }
        Ok(())
    }
}

/// Timing knobs for one runner.
#[derive(Debug, Clone, Copy)]
pub struct ParallelSettings {
    pub task_timeout: Duration,
    pub join_deadline: Duration,
    pub max_parallelism: usize,
}

impl ParallelSettings {
    pub fn from_config(config: &PatchConfig) -> Self {
        Self {
            task_timeout: Duration::from_secs(config.parallel.task_timeout_secs),
            join_deadline: Duration::from_secs(config.parallel.join_deadline_secs),
            max_parallelism: config
                .parallel
                .max_concurrency
                .unwrap_or(DEFAULT_MAX_PARALLELISM)
                .max(1),
        }
    }

    pub fn with_join_deadline(mut self, deadline: Duration) -> Self {
        self.join_deadline = deadline;
        self
    }
}

/// Runs one task per node concurrently, each individually time-boxed, and
/// joins them up to a hard deadline.
#[derive(Debug, Clone, Copy)]
pub struct ParallelTaskRunner {
    settings: ParallelSettings,
}

impl ParallelTaskRunner {
    pub fn new(settings: ParallelSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> ParallelSettings {
        self.settings
    }

    pub async fn run<F, Fut>(&self, label: &str, nodes: &[String], task: F) -> RunReport
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let collector: Arc<Mutex<Vec<TaskResult>>> = Arc::new(Mutex::new(Vec::new()));
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallelism));
        let mut set = JoinSet::new();

        info!(
            label,
            count = nodes.len(),
            task_timeout_secs = self.settings.task_timeout.as_secs(),
            join_deadline_secs = self.settings.join_deadline.as_secs(),
            "Starting parallel tasks"
        );

        for node in nodes {
            let fut = task(node.clone());
            let node = node.clone();
            let collector = Arc::clone(&collector);
            let semaphore = Arc::clone(&semaphore);
            let task_timeout = self.settings.task_timeout;

            set.spawn(async move {
                let entry = match semaphore.acquire_owned().await {
                    Ok(_permit) => match tokio::time::timeout(task_timeout, fut).await {
                        Ok(Ok(())) => TaskResult {
                            node,
                            status: TaskStatus::Succeeded,
                            error_code: None,
                            detail: None,
                        },
                        Ok(Err(e)) => {
                            let pe = PatchError::from_anyhow(&e);
                            TaskResult {
                                node,
                                status: TaskStatus::Failed,
                                error_code: Some(pe.code),
                                detail: Some(pe.message),
                            }
                        }
                        Err(_) => TaskResult {
                            node,
                            status: TaskStatus::TimedOut,
                            error_code: None,
                            detail: Some(format!(
                                "task exceeded {}s",
                                task_timeout.as_secs()
                            )),
                        },
                    },
                    Err(_) => TaskResult {
                        node,
                        status: TaskStatus::Failed,
                        error_code: None,
                        detail: Some("runner shut down".to_string()),
                    },
                };
                collector
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(entry);
            });
        }

        let joined = tokio::time::timeout(self.settings.join_deadline, async {
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    warn!(label, error = %e, "Parallel task panicked");
                }
            }
        })
        .await;

        // Snapshot before aborting so nothing collected after the deadline is trusted.
        let results = collector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let killed = joined.is_err();
        if killed {
            set.abort_all();
        }

        let report = RunReport {
            label: label.to_string(),
            nodes: nodes.to_vec(),
            results,
            killed,
        };

        if killed {
            warn!(
                label,
                unknown = ?report.unknown(),
                "Parallel tasks killed at join deadline"
            );
        } else {
            info!(
                label,
                succeeded = report.succeeded().len(),
                failed = report.failed().len(),
                "Parallel tasks complete"
            );
        }
        report
    }
}
