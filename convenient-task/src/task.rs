//! Task state machine and handles
//!
//! Every unit of work in Kiln (a build phase, a fetch, a whole package
//! pipeline) is a [`Task`]. A task is driven through a [`TaskHandle`], which
//! owns the lifecycle:
//!
//! ```text
//! Idle --start()--> Running --run() returns--> Done
//!   |                                           ^
//!   +---------------cancel()--------------------+
//! ```
//!
//! Once a handle reaches `Done` its returncode never changes. Exit listeners
//! registered with [`TaskHandle::add_exit_listener`] are invoked exactly once,
//! in registration order, on the tokio runtime.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error};

/// Exit status of a finished task.
///
/// Non-negative values are exit codes, negative values are `-signal` for
/// processes that were killed by a signal.
pub type ReturnCode = i32;

/// Successful completion
pub const EX_OK: ReturnCode = 0;

/// Internal software error (sysexits `EX_SOFTWARE`)
pub const EX_SOFTWARE: ReturnCode = 70;

/// Returncode recorded for a task that was cancelled before it produced one
pub const CANCELLED_RETURNCODE: ReturnCode = -nix::libc::SIGINT;

/// Errors from task lifecycle operations
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task '{0}' has already been started")]
    AlreadyStarted(String),

    #[error("Result is not ready for task '{0}'")]
    InvalidState(String),
}

/// Result type for task lifecycle operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Created but not started
    Idle,
    /// Started and not yet finished
    Running,
    /// Finished; the returncode is final
    Done,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Idle => write!(f, "idle"),
            TaskState::Running => write!(f, "running"),
            TaskState::Done => write!(f, "done"),
        }
    }
}

/// Cooperative cancellation signal handed to [`Task::run`]
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Create a linked sender/signal pair
    pub fn channel() -> (CancelSender, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelSender { tx }, Self { rx })
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation has been requested.
    ///
    /// Pends forever when the sending side is gone without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sending side of a [`CancelSignal`]
#[derive(Debug)]
pub struct CancelSender {
    tx: watch::Sender<bool>,
}

impl CancelSender {
    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Create another signal observing this sender
    pub fn subscribe(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// A unit of asynchronous work.
///
/// Implementations must convert every fault into a returncode: nothing
/// escapes a task boundary except the returncode and log output.
#[async_trait]
pub trait Task: Send + 'static {
    /// Human readable name used in logs
    fn name(&self) -> String;

    /// Perform the work. `cancel` fires when the owner requests cooperative
    /// termination; the task should wind down and return its final code.
    async fn run(&mut self, cancel: CancelSignal) -> ReturnCode;
}

/// Callback invoked once after a task reaches [`TaskState::Done`]
pub type ExitListener = Box<dyn FnOnce(&TaskHandle) + Send + 'static>;

struct Shared {
    state: TaskState,
    cancelled: bool,
    returncode: Option<ReturnCode>,
    task: Option<Box<dyn Task>>,
    listeners: Vec<ExitListener>,
}

struct Inner {
    name: String,
    shared: Mutex<Shared>,
    cancel: CancelSender,
    done: watch::Sender<Option<ReturnCode>>,
}

/// Shared handle driving a [`Task`] through its lifecycle
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared();
        f.debug_struct("TaskHandle")
            .field("name", &self.inner.name)
            .field("state", &shared.state)
            .field("cancelled", &shared.cancelled)
            .field("returncode", &shared.returncode)
            .finish()
    }
}

impl TaskHandle {
    /// Wrap a task in an idle handle
    pub fn new(task: impl Task) -> Self {
        Self::from_boxed(Box::new(task))
    }

    /// Wrap an already boxed task in an idle handle
    pub fn from_boxed(task: Box<dyn Task>) -> Self {
        let (cancel, _) = CancelSignal::channel();
        let (done, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                name: task.name(),
                shared: Mutex::new(Shared {
                    state: TaskState::Idle,
                    cancelled: false,
                    returncode: None,
                    task: Some(task),
                    listeners: Vec::new(),
                }),
                cancel,
                done,
            }),
        }
    }

    /// Create a handle and start it immediately
    pub fn spawn(task: impl Task) -> Self {
        let handle = Self::new(task);
        // A fresh handle is always idle, so start cannot fail here.
        let _ = handle.start();
        handle
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.shared().state
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.shared().cancelled
    }

    /// Whether the task has not yet reached `Done`
    pub fn is_alive(&self) -> bool {
        self.shared().state != TaskState::Done
    }

    /// Final returncode, or `None` while not `Done`
    pub fn poll(&self) -> Option<ReturnCode> {
        self.shared().returncode
    }

    /// Start the task on the current tokio runtime and return immediately
    pub fn start(&self) -> TaskResult<()> {
        let task = {
            let mut shared = self.shared();
            if shared.state != TaskState::Idle {
                return Err(TaskError::AlreadyStarted(self.inner.name.clone()));
            }
            match shared.task.take() {
                Some(task) => {
                    shared.state = TaskState::Running;
                    task
                }
                None => return Err(TaskError::AlreadyStarted(self.inner.name.clone())),
            }
        };

        debug!("Starting task '{}'", self.inner.name);
        let handle = self.clone();
        let cancel = self.inner.cancel.subscribe();
        tokio::spawn(async move {
            let mut task = task;
            let returncode = match AssertUnwindSafe(task.run(cancel)).catch_unwind().await {
                Ok(returncode) => returncode,
                Err(_) => {
                    error!("Task '{}' panicked", handle.inner.name);
                    EX_SOFTWARE
                }
            };
            handle.finish(returncode);
        });
        Ok(())
    }

    /// Request cancellation.
    ///
    /// A running task is asked to terminate cooperatively; an idle task
    /// goes straight to `Done` without ever running.
    pub fn cancel(&self) {
        let was_idle = {
            let mut shared = self.shared();
            if shared.cancelled || shared.state == TaskState::Done {
                return;
            }
            shared.cancelled = true;
            if shared.state == TaskState::Idle {
                shared.task = None;
                true
            } else {
                false
            }
        };

        if was_idle {
            debug!("Task '{}' cancelled before start", self.inner.name);
            self.finish(CANCELLED_RETURNCODE);
        } else {
            debug!("Requesting cancellation of task '{}'", self.inner.name);
            self.inner.cancel.cancel();
        }
    }

    /// Wait for the final returncode.
    ///
    /// Fails with [`TaskError::InvalidState`] when the task is idle, since no
    /// completion is scheduled.
    pub async fn wait(&self) -> TaskResult<ReturnCode> {
        let mut done = self.inner.done.subscribe();
        {
            let shared = self.shared();
            if let Some(returncode) = shared.returncode {
                return Ok(returncode);
            }
            if shared.state == TaskState::Idle {
                return Err(TaskError::InvalidState(self.inner.name.clone()));
            }
        }

        let result = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TaskError::InvalidState(self.inner.name.clone()))?;
        match *result {
            Some(returncode) => Ok(returncode),
            None => Err(TaskError::InvalidState(self.inner.name.clone())),
        }
    }

    /// Register a callback to run once after the task is done.
    ///
    /// If the task is already done the callback is still dispatched through
    /// the runtime rather than invoked inline.
    pub fn add_exit_listener<F>(&self, listener: F)
    where
        F: FnOnce(&TaskHandle) + Send + 'static,
    {
        let listener: ExitListener = Box::new(listener);
        let mut shared = self.shared();
        if shared.state == TaskState::Done {
            drop(shared);
            self.dispatch(vec![listener]);
        } else {
            shared.listeners.push(listener);
        }
    }

    fn finish(&self, returncode: ReturnCode) {
        let listeners = {
            let mut shared = self.shared();
            if shared.state == TaskState::Done {
                return;
            }
            shared.state = TaskState::Done;
            shared.returncode = Some(returncode);
            std::mem::take(&mut shared.listeners)
        };

        debug!(
            "Task '{}' finished with returncode {}",
            self.inner.name, returncode
        );
        self.inner.done.send_replace(Some(returncode));
        self.dispatch(listeners);
    }

    fn dispatch(&self, listeners: Vec<ExitListener>) {
        if listeners.is_empty() {
            return;
        }
        let handle = self.clone();
        let notify = move || {
            for listener in listeners {
                listener(&handle);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { notify() });
            }
            Err(_) => notify(),
        }
    }
}
