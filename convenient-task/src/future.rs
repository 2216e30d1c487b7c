//! Adapter turning a plain future into a [`Task`]

use crate::task::{CANCELLED_RETURNCODE, CancelSignal, ReturnCode, Task};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;

/// Task that drives a future to completion.
///
/// On cancellation the future is dropped and the task finishes with
/// [`CANCELLED_RETURNCODE`].
pub struct FutureTask {
    name: String,
    future: Option<BoxFuture<'static, ReturnCode>>,
}

impl FutureTask {
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = ReturnCode> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: Some(Box::pin(future)),
        }
    }
}

#[async_trait]
impl Task for FutureTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&mut self, mut cancel: CancelSignal) -> ReturnCode {
        let Some(future) = self.future.take() else {
            return CANCELLED_RETURNCODE;
        };
        tokio::select! {
            returncode = future => returncode,
            _ = cancel.cancelled() => CANCELLED_RETURNCODE,
        }
    }
}
