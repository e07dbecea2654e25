//! Completion signals for asynchronous lifecycle operations
//!
//! `start` and `shutdown` return a [`Completion`] that resolves once the
//! operation finishes. It is a plain future backed by a oneshot channel, so
//! it can be awaited from any executor, or waited on from synchronous code
//! with [`Completion::wait`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::server::LifecycleError;

type Outcome<T> = Result<T, LifecycleError>;

enum Inner<T> {
    Ready(Option<Outcome<T>>),
    Pending(oneshot::Receiver<Outcome<T>>),
}

/// Resolves once a lifecycle operation has finished
pub struct Completion<T> {
    inner: Inner<T>,
}

/// Sending half of a [`Completion`]
pub struct Completer<T> {
    tx: oneshot::Sender<Outcome<T>>,
}

impl<T> Completer<T> {
    /// Resolve the paired completion. Nothing happens if it was dropped.
    pub fn complete(self, outcome: Outcome<T>) {
        let _ = self.tx.send(outcome);
    }
}

impl<T> Completion<T> {
    /// A completion that will be resolved through the returned completer
    pub fn channel() -> (Completer<T>, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Completer { tx },
            Completion {
                inner: Inner::Pending(rx),
            },
        )
    }

    /// An already resolved completion
    pub fn ready(outcome: Outcome<T>) -> Self {
        Completion {
            inner: Inner::Ready(Some(outcome)),
        }
    }

    /// Block the current thread until the operation finishes.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Outcome<T> {
        match self.inner {
            Inner::Ready(outcome) => outcome.unwrap_or(Err(LifecycleError::Abandoned)),
            Inner::Pending(rx) => rx.blocking_recv().unwrap_or(Err(LifecycleError::Abandoned)),
        }
    }
}

// Never pin-projects into `T`
impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            Inner::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(LifecycleError::Abandoned)))
            }
            Inner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(LifecycleError::Abandoned)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
