//! Work cache.
//!
//! Holds the most recent template fetched from the daemon. Miners always get
//! a copy. A failed refresh keeps the previous template, so work may be
//! slightly stale but is never missing once the cache has been populated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::daemon::{Daemon, DaemonError, WorkTemplate};
use crate::tracing::prelude::*;

/// Failed refreshes tolerated before the served work is reported stale.
const STALE_AFTER_FAILURES: u32 = 6;

#[derive(Debug, Clone)]
struct Cached {
    template: WorkTemplate,
    fetched_at: Instant,
}

pub struct WorkCache {
    daemon: Arc<dyn Daemon>,
    latest: watch::Sender<Option<Cached>>,
    refresh_interval: Duration,
    failed_refreshes: AtomicU32,
    stale_reported: AtomicBool,
}

impl WorkCache {
    pub fn new(daemon: Arc<dyn Daemon>, refresh_interval: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            daemon,
            latest,
            refresh_interval,
            failed_refreshes: AtomicU32::new(0),
            stale_reported: AtomicBool::new(false),
        }
    }

    /// Copy of the latest template, or `None` if the cache was never filled.
    pub fn current(&self) -> Option<WorkTemplate> {
        self.latest.borrow().as_ref().map(|c| c.template.clone())
    }

    /// Time since the served template was fetched.
    pub fn age(&self) -> Option<Duration> {
        self.latest.borrow().as_ref().map(|c| c.fetched_at.elapsed())
    }

    /// True once refreshes have kept failing for longer than the tolerance.
    pub fn is_stale(&self) -> bool {
        self.failed_refreshes.load(Ordering::Relaxed) > STALE_AFTER_FAILURES
    }

    /// Fetch a template and replace the cached one.
    ///
    /// Returns `Ok(false)` when the daemon had no work to hand out; the
    /// previous template, if any, stays in place.
    pub async fn refresh(&self) -> Result<bool, DaemonError> {
        match self.daemon.get_work_template().await {
            Ok(Some(template)) => {
                self.latest.send_replace(Some(Cached {
                    template,
                    fetched_at: Instant::now(),
                }));
                self.failed_refreshes.store(0, Ordering::Relaxed);
                if self.stale_reported.swap(false, Ordering::Relaxed) {
                    info!("Work refresh recovered");
                }
                Ok(true)
            }
            Ok(None) => {
                self.note_failure();
                Ok(false)
            }
            Err(e) => {
                self.note_failure();
                Err(e)
            }
        }
    }

    fn note_failure(&self) {
        let failures = self.failed_refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        if failures > STALE_AFTER_FAILURES && !self.stale_reported.swap(true, Ordering::Relaxed) {
            warn!(
                failures,
                age = ?self.age(),
                "Work refresh keeps failing; serving stale work"
            );
        }
    }

    /// Refresh on a fixed interval until cancelled.
    pub async fn run(self: Arc<Self>, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    break;
                }
                _ = interval.tick() => {
                    match self.refresh().await {
                        Ok(true) => trace!("Work template refreshed"),
                        Ok(false) => debug!("Daemon has no work available"),
                        Err(e) => warn!(error = %e, "Work refresh failed"),
                    }
                }
            }
        }
        debug!("Work cache stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::dummy::DummyDaemon;

    fn cache() -> (Arc<DummyDaemon>, WorkCache) {
        let daemon = Arc::new(DummyDaemon::new());
        let cache = WorkCache::new(daemon.clone(), Duration::from_secs(10));
        (daemon, cache)
    }

    #[tokio::test]
    async fn empty_until_first_refresh() {
        let (_daemon, cache) = cache();
        assert!(cache.current().is_none());
        assert!(cache.age().is_none());

        assert!(cache.refresh().await.unwrap());
        assert!(cache.current().is_some());
    }

    #[tokio::test]
    async fn refresh_replaces_template() {
        let (_daemon, cache) = cache();
        cache.refresh().await.unwrap();
        let first = cache.current().unwrap();
        cache.refresh().await.unwrap();
        let second = cache.current().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_template() {
        let (daemon, cache) = cache();
        cache.refresh().await.unwrap();
        let before = cache.current().unwrap();

        daemon.set_unreachable(true);
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.current(), Some(before.clone()));

        daemon.set_unreachable(false);
        daemon.set_no_work(true);
        assert!(!cache.refresh().await.unwrap());
        assert_eq!(cache.current(), Some(before));
    }

    #[tokio::test]
    async fn unreachable_daemon_never_fills_cache() {
        let (daemon, cache) = cache();
        daemon.set_unreachable(true);
        assert!(cache.refresh().await.is_err());
        assert!(cache.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_after_repeated_failures() {
        let (daemon, cache) = cache();
        cache.refresh().await.unwrap();
        daemon.set_unreachable(true);

        for _ in 0..STALE_AFTER_FAILURES {
            let _ = cache.refresh().await;
        }
        assert!(!cache.is_stale());
        let _ = cache.refresh().await;
        assert!(cache.is_stale());

        daemon.set_unreachable(false);
        cache.refresh().await.unwrap();
        assert!(!cache.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn run_refreshes_until_cancelled() {
        let (_daemon, cache) = cache();
        let cache = Arc::new(cache);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(cache.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(cache.current().is_some());
        assert!(cache.age().unwrap() <= Duration::from_secs(10));

        cancel.cancel();
        handle.await.unwrap();
    }
}
