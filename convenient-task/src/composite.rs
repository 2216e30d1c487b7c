//! Sequential composition of tasks
//!
//! A [`CompositeTask`] runs its subtasks one at a time. Each subtask starts
//! only after its predecessor is done; cancellation is forwarded to the
//! current subtask and the composite waits for it before finishing.

use crate::task::{
    CANCELLED_RETURNCODE, CancelSignal, EX_OK, EX_SOFTWARE, ReturnCode, Task, TaskHandle,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// How a composite reacts to a failing subtask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first nonzero returncode
    #[default]
    AbortOnFirstFailure,
    /// Run every subtask; report the first failure at the end
    ContinueOnFailure,
}

/// An ordered pipeline of tasks
pub struct CompositeTask {
    name: String,
    subtasks: VecDeque<Box<dyn Task>>,
    policy: FailurePolicy,
}

impl CompositeTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subtasks: VecDeque::new(),
            policy: FailurePolicy::default(),
        }
    }

    /// Set the failure policy
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Append a subtask
    pub fn then(mut self, task: impl Task) -> Self {
        self.subtasks.push_back(Box::new(task));
        self
    }

    /// Append an already boxed subtask
    pub fn push(&mut self, task: Box<dyn Task>) {
        self.subtasks.push_back(task);
    }

    /// Number of subtasks not yet started
    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }
}

#[async_trait]
impl Task for CompositeTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&mut self, mut cancel: CancelSignal) -> ReturnCode {
        let mut last = EX_OK;
        let mut first_failure: Option<ReturnCode> = None;

        while let Some(subtask) = self.subtasks.pop_front() {
            if cancel.is_cancelled() {
                debug!("Composite '{}' cancelled before next subtask", self.name);
                self.subtasks.clear();
                return CANCELLED_RETURNCODE;
            }

            let current = TaskHandle::from_boxed(subtask);
            if let Err(e) = current.start() {
                warn!("Composite '{}' could not start subtask: {}", self.name, e);
                return EX_SOFTWARE;
            }
            debug!("Composite '{}' running '{}'", self.name, current.name());

            let returncode = tokio::select! {
                result = current.wait() => result,
                _ = cancel.cancelled() => {
                    info!("Cancelling '{}' in '{}'", current.name(), self.name);
                    current.cancel();
                    current.wait().await
                }
            };
            let returncode = match returncode {
                Ok(returncode) => returncode,
                Err(e) => {
                    warn!("Composite '{}' lost subtask result: {}", self.name, e);
                    EX_SOFTWARE
                }
            };
            last = returncode;

            if cancel.is_cancelled() {
                self.subtasks.clear();
                // A subtask that ignored the request must not turn it into success.
                return if returncode == EX_OK {
                    CANCELLED_RETURNCODE
                } else {
                    returncode
                };
            }
            if returncode != EX_OK {
                match self.policy {
                    FailurePolicy::AbortOnFirstFailure => {
                        debug!(
                            "Composite '{}' stopping after '{}' failed with {}",
                            self.name,
                            current.name(),
                            returncode
                        );
                        self.subtasks.clear();
                        return returncode;
                    }
                    FailurePolicy::ContinueOnFailure => {
                        first_failure.get_or_insert(returncode);
                    }
                }
            }
        }

        first_failure.unwrap_or(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureTask;
    use crate::task::TaskState;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recording(name: &'static str, code: ReturnCode, log: Arc<Mutex<Vec<&'static str>>>) -> FutureTask {
        FutureTask::new(name, async move {
            log.lock().unwrap().push(name);
            code
        })
    }

    #[tokio::test]
    async fn test_runs_subtasks_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeTask::new("pipeline")
            .then(recording("fetch", 0, log.clone()))
            .then(recording("build", 0, log.clone()))
            .then(recording("merge", 0, log.clone()));

        let handle = TaskHandle::spawn(composite);
        assert_eq!(handle.wait().await.unwrap(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["fetch", "build", "merge"]);
    }

    #[tokio::test]
    async fn test_failed_subtask_stops_pipeline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeTask::new("pipeline")
            .then(recording("fetch", 1, log.clone()))
            .then(recording("build", 0, log.clone()));

        let handle = TaskHandle::spawn(composite);
        assert_eq!(handle.wait().await.unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["fetch"]);
    }

    #[tokio::test]
    async fn test_continue_policy_reports_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeTask::new("cleanup")
            .with_policy(FailurePolicy::ContinueOnFailure)
            .then(recording("a", 0, log.clone()))
            .then(recording("b", 4, log.clone()))
            .then(recording("c", 7, log.clone()))
            .then(recording("d", 0, log.clone()));

        let handle = TaskHandle::spawn(composite);
        assert_eq!(handle.wait().await.unwrap(), 4);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_empty_composite_succeeds() {
        let handle = TaskHandle::spawn(CompositeTask::new("empty"));
        assert_eq!(handle.wait().await.unwrap(), EX_OK);
    }

    #[tokio::test]
    async fn test_cancel_forwards_to_current_subtask() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeTask::new("pipeline")
            .then(FutureTask::new("slow", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                0
            }))
            .then(recording("after", 0, log.clone()));

        let handle = TaskHandle::spawn(composite);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        assert_eq!(handle.wait().await.unwrap(), CANCELLED_RETURNCODE);
        assert_eq!(handle.state(), TaskState::Done);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_right_after_spawn_is_not_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeTask::new("pipeline")
            .then(FutureTask::new("slow", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                0
            }))
            .then(recording("after", 0, log.clone()));

        let handle = TaskHandle::spawn(composite);
        handle.cancel();

        assert_eq!(handle.wait().await.unwrap(), CANCELLED_RETURNCODE);
        assert!(log.lock().unwrap().is_empty());
    }

    /// Finishes successfully no matter what
    struct IgnoresCancel {
        started: Option<tokio::sync::oneshot::Sender<()>>,
    }

    #[async_trait]
    impl Task for IgnoresCancel {
        fn name(&self) -> String {
            "stubborn".into()
        }

        async fn run(&mut self, _cancel: CancelSignal) -> ReturnCode {
            if let Some(started) = self.started.take() {
                let _ = started.send(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            EX_OK
        }
    }

    #[tokio::test]
    async fn test_subtask_ignoring_cancel_does_not_report_success() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let composite = CompositeTask::new("pipeline").then(IgnoresCancel {
            started: Some(started_tx),
        });

        let handle = TaskHandle::spawn(composite);
        started_rx.await.unwrap();
        handle.cancel();

        assert_eq!(handle.wait().await.unwrap(), CANCELLED_RETURNCODE);
    }
}
