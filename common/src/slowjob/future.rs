// Copyright James Carl (C) 2020
// AGPL-3.0-or-later

//! Lets the caller of a slow job wait for its result.

use super::{JobError, JobResult};
use futures::channel::oneshot;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// The sending half. Consuming it is what guarantees the result is delivered at most once.
pub(crate) struct Completer<R> {
    sender: oneshot::Sender<JobResult<R>>,
}

impl<R> Completer<R> {
    /// Deliver the outcome of the job. If nobody is waiting anymore, the outcome is dropped.
    pub(crate) fn complete(self, outcome: JobResult<R>) {
        // An error only means the future was dropped.
        let _ = self.sender.send(outcome);
    }
}

/// Resolves once the job it belongs to is done.
///
/// The output is the job's return value, [`JobError::Panicked`] if the job panicked, or
/// [`JobError::Cancelled`] if the job was dropped before it ever ran.
#[must_use = "futures do nothing unless polled"]
pub struct JobFuture<R> {
    receiver: oneshot::Receiver<JobResult<R>>,
}

impl<R> JobFuture<R> {
    /// Block the current thread until the job is done.
    pub fn wait(self) -> JobResult<R> {
        futures::executor::block_on(self)
    }
}

impl<R> Future for JobFuture<R> {
    type Output = JobResult<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The sender was dropped without a result, which only happens if the job never ran.
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(JobError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a linked completer and future.
pub(crate) fn channel<R>() -> (Completer<R>, JobFuture<R>) {
    let (sender, receiver) = oneshot::channel();
    (Completer { sender }, JobFuture { receiver })
}

#[cfg(test)]
mod test_future {
    use super::*;

    #[test]
    fn delivers_result() {
        let (completer, future) = channel();
        completer.complete(Ok(7));
        assert_eq!(future.wait(), Ok(7));
    }

    #[test]
    fn dropped_completer_means_cancelled() {
        let (completer, future) = channel::<()>();
        drop(completer);
        assert_eq!(future.wait(), Err(JobError::Cancelled));
    }
}
