//! Background refresh of cached privileges.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::authorizer::PrivilegesFetcher;
use crate::cache::PrivilegeCache;
use crate::error::{BackendError, BackendTimeout, Error, Result};
use crate::types::{Principal, PrivilegeSet};

/// Outcome of one refresh pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Principals whose entry was replaced.
    pub refreshed: usize,
    /// Principals left stale because the backend call failed.
    pub failed: usize,
}

/// Re-fetches every cached principal's privileges from the backend.
#[derive(Debug)]
pub struct PrivilegeSync<F> {
    fetcher: Arc<F>,
    cache: Arc<PrivilegeCache>,
    timeout: Duration,
    parallelism: usize,
    active: bool,
}

impl<F> PrivilegeSync<F>
where
    F: PrivilegesFetcher + 'static,
{
    /// Creates a refresher over a shared cache.
    ///
    /// An inactive refresher (authorization or caching disabled) does nothing.
    pub fn new(
        fetcher: Arc<F>,
        cache: Arc<PrivilegeCache>,
        timeout: Duration,
        parallelism: usize,
        active: bool,
    ) -> Self {
        Self {
            fetcher,
            cache,
            timeout,
            parallelism: parallelism.max(1),
            active,
        }
    }

    /// Refreshes every principal present in the cache when the pass starts.
    ///
    /// Each principal is fetched independently with at most `parallelism`
    /// calls in flight. A failed fetch leaves that principal's entry as it was
    /// and does not stop the others.
    pub async fn run_one_iteration(&self) -> SyncReport {
        let mut report = SyncReport::default();
        if !self.active {
            return report;
        }

        let principals = self.cache.keys();
        debug!("refreshing privileges for {} principal(s)", principals.len());

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut tasks = JoinSet::new();
        for principal in principals {
            let semaphore = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            let timeout = self.timeout;
            tasks.spawn(async move {
                // Held until the fetch completes.
                let _permit = semaphore.acquire_owned().await.ok();
                let fetched = fetch_privileges(fetcher.as_ref(), &principal, timeout).await;
                (principal, fetched)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((principal, Ok(privileges))) => {
                    trace!(
                        "refreshed {} privilege(s) for {principal}",
                        privileges.len()
                    );
                    self.cache.put(principal, privileges);
                    report.refreshed += 1;
                }
                Ok((principal, Err(err))) => {
                    warn!("failed to refresh privileges for {principal}: {err}");
                    report.failed += 1;
                }
                Err(err) => {
                    warn!("privilege refresh task did not complete: {err}");
                    report.failed += 1;
                }
            }
        }

        debug!(
            "privilege refresh finished: {} refreshed, {} failed",
            report.refreshed, report.failed
        );
        report
    }

    /// Runs [`Self::run_one_iteration`] every `period` on a background task.
    ///
    /// The first pass starts immediately. Must be called from within a tokio
    /// runtime. A zero `period` is rejected as [`Error::Configuration`].
    pub fn spawn(self: Arc<Self>, period: Duration) -> Result<SyncHandle> {
        if period.is_zero() {
            return Err(Error::Configuration(
                "privilege refresh period must be greater than zero".to_string(),
            ));
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        debug!("abandoning in-flight privilege refresh");
                        break;
                    }
                    _ = self.run_one_iteration() => {}
                }
            }
            info!("privilege sync stopped");
        });

        Ok(SyncHandle {
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }
}

/// Owner of a running refresh task.
///
/// Dropping the handle without calling [`SyncHandle::stop`] aborts the task.
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Signals the task to stop and waits for it to exit.
    ///
    /// No new pass starts once this is called; an in-flight pass is abandoned.
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
            && err.is_panic()
        {
            warn!("privilege sync task panicked: {err}");
        }
    }

    /// Returns true while the background task has not exited.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.shutdown.send_replace(true);
            task.abort();
        }
    }
}

/// Fetches a principal's privileges, bounded by `timeout`.
///
/// Both backend errors and timeouts come back as
/// [`Error::BackendUnavailable`]; a timeout never reads as "no privileges".
pub(crate) async fn fetch_privileges<F>(
    fetcher: &F,
    principal: &Principal,
    timeout: Duration,
) -> Result<PrivilegeSet>
where
    F: PrivilegesFetcher + ?Sized,
{
    match tokio::time::timeout(timeout, fetcher.list_privileges(principal)).await {
        Ok(fetched) => fetched.map_err(Error::from),
        Err(_) => Err(timed_out("list_privileges", timeout)),
    }
}

pub(crate) fn timed_out(operation: &'static str, timeout: Duration) -> Error {
    let cause: BackendError = Box::new(BackendTimeout { operation, timeout });
    Error::BackendUnavailable(cause)
}
