//! Per-call context: deadline and cancellation.
//!
//! Every long-running operation belonging to a call observes a
//! [`CallContext`]. The done flag is monotone; once a context is cancelled
//! it stays cancelled, and waiters are woken exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context became done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// The peer (or local caller) cancelled the call.
    Cancelled,
    /// The call deadline expired.
    DeadlineExceeded,
}

/// Observer half of a call's cancellation signal, plus its deadline.
#[derive(Clone, Debug)]
pub struct CallContext {
    deadline: Option<Instant>,
    done: watch::Receiver<Option<DoneReason>>,
}

/// Owner half: marks the context done. Cloneable so the transport and the
/// deadline timer can both hold one.
#[derive(Clone, Debug)]
pub struct ContextCanceller {
    done: Arc<watch::Sender<Option<DoneReason>>>,
}

/// Creates a context and its canceller.
pub fn with_deadline(deadline: Option<Instant>) -> (CallContext, ContextCanceller) {
    let (tx, rx) = watch::channel(None);
    (
        CallContext { deadline, done: rx },
        ContextCanceller { done: Arc::new(tx) },
    )
}

impl CallContext {
    /// The absolute deadline of this call, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining until the deadline. `None` when no deadline is set.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the context has been marked done.
    pub fn is_done(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Why the context is done, if it is.
    pub fn done_reason(&self) -> Option<DoneReason> {
        *self.done.borrow()
    }

    /// Suspends until the context is done. Never resolves for a call that
    /// completes normally; callers `select!` this against their own work.
    pub async fn done(&self) {
        let mut done = self.done.clone();
        // wait_for only errors when the sender is dropped, which means the
        // call finished without being cancelled; park forever in that case.
        if done.wait_for(|reason| reason.is_some()).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl ContextCanceller {
    /// Marks the context done. The first reason wins.
    pub fn cancel(&self, reason: DoneReason) {
        self.done.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_reason_wins() {
        let (ctx, canceller) = with_deadline(None);
        canceller.cancel(DoneReason::DeadlineExceeded);
        canceller.cancel(DoneReason::Cancelled);
        assert_eq!(ctx.done_reason(), Some(DoneReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn done_wakes_waiters() {
        let (ctx, canceller) = with_deadline(None);
        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.done().await }
        });
        canceller.cancel(DoneReason::Cancelled);
        waiter.await.unwrap();
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn time_remaining_tracks_the_clock() {
        let deadline = Instant::now() + Duration::from_secs(10);
        let (ctx, _canceller) = with_deadline(Some(deadline));
        tokio::time::advance(Duration::from_secs(4)).await;
        let remaining = ctx.time_remaining().unwrap();
        assert!(remaining <= Duration::from_secs(6));
    }
}
