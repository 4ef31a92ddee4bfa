//! Units of work started and stopped by the manager

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure of a runnable; stops the whole manager
#[derive(Debug, Error)]
#[error("runnable {name} failed: {message}")]
pub struct RunnableError {
    /// Runnable name
    pub name: String,
    /// What went wrong
    pub message: String,
}

impl RunnableError {
    /// Create an error for the named runnable
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// When a runnable starts and in which order it is stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RunnableGroup {
    /// Informer caches; started first, stopped last
    Caches,
    /// HTTP servers and other standby work; run on every replica
    Servers,
    /// Controllers and writers; run only on the leader, stopped first
    LeaderElected,
}

/// A long running task driven by the manager
///
/// `start` must return once `shutdown` is cancelled. Returning an error makes
/// the manager shut down; returning `Ok` early only ends this runnable, which
/// suits one-shot work. Long running work goes through [`until_cancelled`] so
/// that stopping on its own counts as a failure.
#[async_trait]
pub trait Runnable: Send {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Group deciding start gating and stop order
    fn group(&self) -> RunnableGroup {
        RunnableGroup::LeaderElected
    }

    /// Whether this runnable may only run on the elected leader
    fn needs_leader_election(&self) -> bool {
        self.group() == RunnableGroup::LeaderElected
    }

    /// Run until `shutdown` is cancelled
    async fn start(self: Box<Self>, shutdown: CancellationToken) -> Result<(), RunnableError>;
}

type BoxedStart =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), RunnableError>> + Send>> + Send>;

struct FnRunnable {
    name: String,
    group: RunnableGroup,
    start: BoxedStart,
}

#[async_trait]
impl Runnable for FnRunnable {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> RunnableGroup {
        self.group
    }

    async fn start(self: Box<Self>, shutdown: CancellationToken) -> Result<(), RunnableError> {
        (self.start)(shutdown).await
    }
}

/// Wrap a closure as a runnable
pub fn runnable_fn<F, Fut>(name: impl Into<String>, group: RunnableGroup, f: F) -> Box<dyn Runnable>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), RunnableError>> + Send + 'static,
{
    Box::new(FnRunnable {
        name: name.into(),
        group,
        start: Box::new(move |token| Box::pin(f(token))),
    })
}

/// Drive `work` until `shutdown` is cancelled
///
/// Work that completes first is reported as a failure of runnable `name`.
pub async fn until_cancelled<F>(
    name: &str,
    shutdown: CancellationToken,
    work: F,
) -> Result<(), RunnableError>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        _ = work => Err(RunnableError::new(name, "stopped before shutdown was requested")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_runnable_stops_on_cancellation() {
        let runnable = runnable_fn("sleeper", RunnableGroup::Servers, |token| async move {
            token.cancelled().await;
            Ok(())
        });
        assert_eq!(runnable.name(), "sleeper");
        assert!(!runnable.needs_leader_election());

        let token = CancellationToken::new();
        let handle = tokio::spawn(runnable.start(token.clone()));
        token.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn work_ending_before_cancellation_is_a_failure() {
        let err = until_cancelled("controller", CancellationToken::new(), async {})
            .await
            .unwrap_err();
        assert_eq!(err.name, "controller");
    }

    #[tokio::test]
    async fn cancelled_work_stops_cleanly() {
        let token = CancellationToken::new();
        token.cancel();
        let result = until_cancelled("controller", token, std::future::pending::<()>()).await;
        assert!(result.is_ok());
    }

    #[test]
    fn leader_group_needs_election() {
        let runnable = runnable_fn("controller", RunnableGroup::LeaderElected, |_| async { Ok(()) });
        assert!(runnable.needs_leader_election());
    }

    #[test]
    fn groups_order_caches_first() {
        assert!(RunnableGroup::Caches < RunnableGroup::Servers);
        assert!(RunnableGroup::Servers < RunnableGroup::LeaderElected);
    }
}
