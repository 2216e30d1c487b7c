//! Bounded FIFO admission for tasks
//!
//! The queue starts at most `max_concurrent` tasks at a time and services
//! waiting tasks strictly in arrival order. A slot is freed when an admitted
//! task reaches `Done`. Kiln uses one queue per run to limit concurrent
//! network fetches.

use crate::task::{TaskHandle, TaskState};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct QueueState {
    running: usize,
    waiting: VecDeque<TaskHandle>,
}

#[derive(Debug)]
struct Shared {
    name: String,
    max_concurrent: usize,
    state: Mutex<QueueState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded concurrency queue
#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl AdmissionQueue {
    /// Create a queue admitting at most `max_concurrent` tasks (at least one)
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    /// Number of admitted tasks that are not yet done
    pub fn running_count(&self) -> usize {
        self.shared.state().running
    }

    /// Number of tasks waiting for a slot
    pub fn waiting_count(&self) -> usize {
        self.shared.state().waiting.len()
    }

    /// Enqueue an idle task; it is started as soon as a slot is free.
    ///
    /// A task cancelled while waiting is skipped when its turn comes.
    pub fn schedule(&self, task: TaskHandle) {
        debug!("Queueing '{}' in '{}'", task.name(), self.shared.name);
        self.shared.state().waiting.push_back(task);
        admit(&self.shared);
    }
}

fn admit(shared: &Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state();
            if state.running >= shared.max_concurrent {
                return;
            }
            let Some(task) = state.waiting.pop_front() else {
                return;
            };
            if task.state() != TaskState::Idle {
                debug!("Skipping '{}', no longer idle", task.name());
                continue;
            }
            state.running += 1;
            task
        };

        let listener_shared = Arc::clone(shared);
        task.add_exit_listener(move |_| {
            {
                let mut state = listener_shared.state();
                state.running = state.running.saturating_sub(1);
            }
            admit(&listener_shared);
        });

        debug!("Admitting '{}' in '{}'", task.name(), shared.name);
        if let Err(e) = task.start() {
            // Cancelled between the check and the start; its listener
            // releases the slot.
            warn!("Could not start '{}': {}", task.name(), e);
        }
    }
}
