//! Asynchronous task supervision for Kiln
//!
//! This crate provides the task model the build pipeline is made of:
//!
//! - [`Task`] / [`TaskHandle`]: Idle → Running → Done state machine with
//!   cooperative cancellation and exit listeners
//! - [`CompositeTask`]: strictly sequential pipelines
//! - [`FutureTask`]: any future as a task
//! - [`ProcessTask`]: OS processes with pipe/pty output capture and
//!   SIGTERM → SIGKILL escalation
//! - [`ForkTask`]: in-process entry points run in a child process
//! - [`AdmissionQueue`]: bounded FIFO admission
//!
//! # Example
//!
//! ```no_run
//! use convenient_task::{CompositeTask, ProcessTask, TaskHandle};
//!
//! # async fn demo() {
//! let pipeline = CompositeTask::new("hello")
//!     .then(ProcessTask::command("greet", ["echo", "hello"]))
//!     .then(ProcessTask::command("done", ["true"]));
//!
//! let handle = TaskHandle::spawn(pipeline);
//! let returncode = handle.wait().await.unwrap_or(1);
//! # }
//! ```

pub mod admission;
pub mod composite;
pub mod fork;
pub mod future;
pub mod process;
pub mod task;

pub use admission::AdmissionQueue;
pub use composite::{CompositeTask, FailurePolicy};
pub use fork::{
    DescriptorStrategy, EntryPoint, EntryPoints, ForkError, ForkLauncher, ForkStrategy, ForkTarget,
    ForkTask, InheritDescriptors, TransferDescriptors, child_main,
};
pub use future::FutureTask;
pub use process::{
    CommandLauncher, FdMap, Launcher, OutputMode, ProcessError, ProcessExit, ProcessResult,
    ProcessSpec, ProcessTask, RunningProcess, Termination,
};
pub use task::{
    CANCELLED_RETURNCODE, CancelSignal, EX_OK, EX_SOFTWARE, ReturnCode, Task, TaskError,
    TaskHandle, TaskResult, TaskState,
};
