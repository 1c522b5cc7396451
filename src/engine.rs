use crate::authorizer::PrivilegesFetcher;
use crate::cache::PrivilegeCache;
use crate::config::{AUTHORIZATION_ENABLED, CACHE_ENABLED, EnforcementConfig};
use crate::error::{Error, Result};
use crate::sync::{PrivilegeSync, SyncHandle, SyncReport, fetch_privileges, timed_out};
use crate::types::{Action, EntityId, Principal, Privilege, PrivilegeSet};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

/// Failure of a shared lazy fetch, handed to every caller waiting on it.
type FetchCause = Arc<dyn std::error::Error + Send + Sync>;

/// A lazy fetch awaited by every caller that missed on the same principal.
type InFlightFetch = Shared<BoxFuture<'static, std::result::Result<Arc<PrivilegeSet>, FetchCause>>>;

/// Lazy fetches in progress, keyed by principal.
#[derive(Default)]
struct InFlight(DashMap<Principal, InFlightFetch>);

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight").field("len", &self.0.len()).finish()
    }
}

#[derive(Debug, Default)]
enum SyncState {
    #[default]
    Idle,
    Running(SyncHandle),
    Stopped,
}

/// Authorization enforcement engine with a pluggable backend and an optional
/// background-refreshed privilege cache.
///
/// Behavior depends on two toggles:
/// - authorization disabled: every check succeeds, nothing is cached;
/// - caching disabled: every check calls the backend;
/// - both enabled: checks read the cache, fetching on a miss, while a
///   background task keeps cached principals fresh.
#[derive(Debug)]
pub struct EnforcementEngine<F> {
    fetcher: Arc<F>,
    cache: Arc<PrivilegeCache>,
    sync: Arc<PrivilegeSync<F>>,
    config: EnforcementConfig,
    in_flight: Arc<InFlight>,
    sync_state: Mutex<SyncState>,
}

/// Builder for [`EnforcementEngine`].
pub struct EngineBuilder<F> {
    fetcher: F,
    config: EnforcementConfig,
}

impl<F> EngineBuilder<F> {
    /// Creates a new builder with default configuration.
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            config: EnforcementConfig::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: EnforcementConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables or disables authorization.
    pub fn authorization_enabled(mut self, on: bool) -> Self {
        self.config = self.config.with_authorization_enabled(on);
        self
    }

    /// Enables or disables privilege caching.
    pub fn cache_enabled(mut self, on: bool) -> Self {
        self.config = self.config.with_cache_enabled(on);
        self
    }

    /// Builds the engine. The background refresh starts with
    /// [`EnforcementEngine::start`].
    pub fn build(self) -> Result<EnforcementEngine<F>>
    where
        F: PrivilegesFetcher + 'static,
    {
        self.config.validate()?;
        let fetcher = Arc::new(self.fetcher);
        let cache = Arc::new(PrivilegeCache::new());
        let sync = Arc::new(PrivilegeSync::new(
            Arc::clone(&fetcher),
            Arc::clone(&cache),
            self.config.backend_timeout(),
            self.config.refresh_parallelism(),
            self.config.caching_active(),
        ));

        Ok(EnforcementEngine {
            fetcher,
            cache,
            sync,
            config: self.config,
            in_flight: Arc::default(),
            sync_state: Mutex::default(),
        })
    }
}

impl<F> EnforcementEngine<F>
where
    F: PrivilegesFetcher + 'static,
{
    /// Checks that `principal` may perform `action` on `entity`.
    ///
    /// Returns [`Error::PermissionDenied`] when the privilege is absent and
    /// [`Error::BackendUnavailable`] when it could not be determined. Never
    /// allows on backend failure.
    pub async fn enforce(
        &self,
        entity: &EntityId,
        principal: &Principal,
        action: Action,
    ) -> Result<()> {
        if !self.config.authorization_enabled() {
            return Ok(());
        }
        if !self.config.cache_enabled() {
            return self.enforce_direct(entity, principal, action).await;
        }

        let privileges = match self.cache.get(principal) {
            Some(privileges) => privileges,
            None if self.config.fetch_on_miss() => {
                debug!("no cached privileges for {principal}, fetching");
                self.fetch_on_miss(principal).await?
            }
            None => return Err(Error::denied(principal, entity, action)),
        };

        if privileges.contains(&Privilege::new(entity.clone(), action)) {
            Ok(())
        } else {
            Err(Error::denied(principal, entity, action))
        }
    }

    /// Fetches a principal's privileges and replaces its cache entry.
    ///
    /// An empty result is cached as such. No-op unless both authorization and
    /// caching are enabled, so a disabled cache stays empty.
    pub async fn update_privileges(&self, principal: &Principal) -> Result<()> {
        if !self.config.caching_active() {
            return Ok(());
        }
        self.fetch_and_cache(principal).await.map(|_| ())
    }

    /// Runs one refresh pass over the cached principals.
    pub async fn run_one_iteration(&self) -> SyncReport {
        self.sync.run_one_iteration().await
    }

    /// Starts the background refresh.
    ///
    /// Does nothing when authorization or caching is disabled, or when already
    /// started. Must be called from within a tokio runtime. An engine that has
    /// been shut down cannot be started again.
    pub fn start(&self) -> Result<()> {
        if !self.config.authorization_enabled() && self.config.cache_enabled() {
            warn!(
                "privilege caching is enabled ({CACHE_ENABLED} is true), however no privileges \
                 will be cached because authorization is disabled ({AUTHORIZATION_ENABLED} is false)"
            );
        }
        if !self.config.caching_active() {
            return Ok(());
        }

        let mut state = self.sync_state.lock().expect("poisoned lock");
        match *state {
            SyncState::Idle => {}
            SyncState::Running(_) => return Ok(()),
            SyncState::Stopped => {
                return Err(Error::Configuration(
                    "the enforcement engine has been shut down".to_string(),
                ));
            }
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Configuration(
                "the enforcement engine must be started inside a tokio runtime".to_string(),
            ));
        }

        let period = self.config.refresh_interval();
        info!(
            "starting privilege sync every {}",
            humantime::format_duration(period)
        );
        *state = SyncState::Running(Arc::clone(&self.sync).spawn(period)?);
        Ok(())
    }

    /// Stops the background refresh, waiting for the task to exit.
    ///
    /// Safe to call more than once, and before [`Self::start`]. Once shut down
    /// the refresh never runs again. Dropping the engine also stops the task.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(
            &mut *self.sync_state.lock().expect("poisoned lock"),
            SyncState::Stopped,
        );
        if let SyncState::Running(handle) = previous {
            info!("shutting down privilege sync");
            handle.stop().await;
        }
    }

    /// Returns true while the background refresh task is alive.
    pub fn is_running(&self) -> bool {
        matches!(
            &*self.sync_state.lock().expect("poisoned lock"),
            SyncState::Running(handle) if handle.is_running()
        )
    }

    /// Drops every cached entry, e.g. after the backend extension is reloaded.
    pub fn invalidate_all(&self) {
        debug!("clearing {} cached principal(s)", self.cache.len());
        self.cache.clear();
    }

    /// Cached privileges for a principal, if it has an entry.
    pub fn cached_privileges(&self, principal: &Principal) -> Option<Arc<PrivilegeSet>> {
        self.cache.get(principal)
    }

    pub fn cache(&self) -> &PrivilegeCache {
        &self.cache
    }

    pub fn config(&self) -> &EnforcementConfig {
        &self.config
    }

    async fn fetch_and_cache(&self, principal: &Principal) -> Result<Arc<PrivilegeSet>> {
        let privileges = fetch_privileges(
            self.fetcher.as_ref(),
            principal,
            self.config.backend_timeout(),
        )
        .await?;
        trace!("caching {} privilege(s) for {principal}", privileges.len());
        Ok(self.cache.put(principal.clone(), privileges))
    }

    /// Joins the fetch already running for `principal`, or starts one.
    ///
    /// Concurrent misses on the same principal share one backend call. Its
    /// failure reaches every waiter as [`Error::BackendUnavailable`].
    async fn fetch_on_miss(&self, principal: &Principal) -> Result<Arc<PrivilegeSet>> {
        let fetch = match self.in_flight.0.entry(principal.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // a fetch may have completed since the cache was read
                if let Some(privileges) = self.cache.get(principal) {
                    return Ok(privileges);
                }
                entry.insert(self.shared_fetch(principal.clone())).clone()
            }
        };
        fetch.await.map_err(|cause| Error::BackendUnavailable(Box::new(cause)))
    }

    fn shared_fetch(&self, principal: Principal) -> InFlightFetch {
        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let timeout = self.config.backend_timeout();

        async move {
            let outcome = match fetch_privileges(fetcher.as_ref(), &principal, timeout).await {
                Ok(privileges) => {
                    trace!("caching {} privilege(s) for {principal}", privileges.len());
                    Ok(cache.put(principal.clone(), privileges))
                }
                Err(Error::BackendUnavailable(source)) => Err(FetchCause::from(source)),
                Err(err) => Err(Arc::new(err) as FetchCause),
            };
            in_flight.0.remove(&principal);
            outcome
        }
        .boxed()
        .shared()
    }

    async fn enforce_direct(
        &self,
        entity: &EntityId,
        principal: &Principal,
        action: Action,
    ) -> Result<()> {
        let timeout = self.config.backend_timeout();
        let allowed = tokio::time::timeout(timeout, self.fetcher.enforce(entity, principal, action))
            .await
            .map_err(|_| timed_out("enforce", timeout))?
            .map_err(Error::from)?;
        if allowed {
            Ok(())
        } else {
            Err(Error::denied(principal, entity, action))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct TestBackend {
        privileges: RwLock<HashMap<Principal, PrivilegeSet>>,
        down: AtomicBool,
        hang: AtomicBool,
        slow: AtomicBool,
        list_calls: AtomicUsize,
        enforce_calls: AtomicUsize,
    }

    impl TestBackend {
        fn grant(&self, principal: &Principal, entity: &EntityId, action: Action) {
            self.privileges
                .write()
                .unwrap()
                .entry(principal.clone())
                .or_default()
                .insert(Privilege::new(entity.clone(), action));
        }

        fn revoke_everything(&self, principal: &Principal) {
            self.privileges.write().unwrap().remove(principal);
        }

        async fn check(&self) -> std::result::Result<(), BackendError> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err("connection refused".into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PrivilegesFetcher for TestBackend {
        async fn list_privileges(
            &self,
            principal: &Principal,
        ) -> std::result::Result<PrivilegeSet, BackendError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.check().await?;
            Ok(self
                .privileges
                .read()
                .unwrap()
                .get(principal)
                .cloned()
                .unwrap_or_default())
        }

        async fn enforce(
            &self,
            entity: &EntityId,
            principal: &Principal,
            action: Action,
        ) -> std::result::Result<bool, BackendError> {
            self.enforce_calls.fetch_add(1, Ordering::SeqCst);
            self.check().await?;
            Ok(self
                .privileges
                .read()
                .unwrap()
                .get(principal)
                .is_some_and(|set| set.contains(&Privilege::new(entity.clone(), action))))
        }
    }

    fn alice() -> Principal {
        Principal::user("alice").unwrap()
    }

    fn ns() -> EntityId {
        EntityId::namespace("ns").unwrap()
    }

    fn engine(backend: &Arc<TestBackend>, config: EnforcementConfig) -> EnforcementEngine<Arc<TestBackend>> {
        EngineBuilder::new(Arc::clone(backend))
            .config(config)
            .build()
            .unwrap()
    }

    fn enabled() -> EnforcementConfig {
        EnforcementConfig::default().with_authorization_enabled(true)
    }

    #[tokio::test]
    async fn disabled_authorization_should_allow_without_backend() {
        let backend = Arc::new(TestBackend::default());
        backend.down.store(true, Ordering::SeqCst);
        let engine = engine(&backend, EnforcementConfig::default());

        for action in Action::ALL {
            engine.enforce(&ns(), &alice(), action).await.unwrap();
        }
        engine.update_privileges(&alice()).await.unwrap();

        assert!(engine.cache().is_empty());
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.enforce_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_cache_should_call_backend_every_time() {
        let backend = Arc::new(TestBackend::default());
        backend.grant(&alice(), &ns(), Action::Read);
        let engine = engine(&backend, enabled().with_cache_enabled(false));

        engine.enforce(&ns(), &alice(), Action::Read).await.unwrap();
        engine.enforce(&ns(), &alice(), Action::Read).await.unwrap();
        let err = engine.enforce(&ns(), &alice(), Action::Write).await.unwrap_err();
        engine.update_privileges(&alice()).await.unwrap();

        assert!(err.is_permission_denied());
        assert_eq!(backend.enforce_calls.load(Ordering::SeqCst), 3);
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_should_fail_closed_when_backend_down() {
        let backend = Arc::new(TestBackend::default());
        backend.grant(&alice(), &ns(), Action::Read);
        backend.down.store(true, Ordering::SeqCst);
        let engine = engine(&backend, enabled().with_cache_enabled(false));

        let err = engine.enforce(&ns(), &alice(), Action::Read).await.unwrap_err();
        assert!(err.is_backend_unavailable());
    }

    #[tokio::test]
    async fn cache_miss_should_fetch_once_then_serve_from_cache() {
        let backend = Arc::new(TestBackend::default());
        backend.grant(&alice(), &ns(), Action::Read);
        let engine = engine(&backend, enabled());

        engine.enforce(&ns(), &alice(), Action::Read).await.unwrap();
        engine.enforce(&ns(), &alice(), Action::Read).await.unwrap();
        let err = engine.enforce(&ns(), &alice(), Action::Admin).await.unwrap_err();

        assert!(matches!(
            err,
            Error::PermissionDenied { action: Action::Admin, .. }
        ));
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.cache().len(), 1);
    }

    #[tokio::test]
    async fn cache_miss_without_fetch_should_deny() {
        let backend = Arc::new(TestBackend::default());
        backend.grant(&alice(), &ns(), Action::Read);
        let engine = engine(&backend, enabled().with_fetch_on_miss(false));

        let err = engine.enforce(&ns(), &alice(), Action::Read).await.unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 0);

        engine.update_privileges(&alice()).await.unwrap();
        engine.enforce(&ns(), &alice(), Action::Read).await.unwrap();
    }

    #[tokio::test]
    async fn failed_lazy_fetch_should_be_backend_unavailable() {
        let backend = Arc::new(TestBackend::default());
        backend.down.store(true, Ordering::SeqCst);
        let engine = engine(&backend, enabled());

        let err = engine.enforce(&ns(), &alice(), Action::Read).await.unwrap_err();

        assert!(err.is_backend_unavailable());
        assert!(engine.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_should_time_out_as_unavailable() {
        let backend = Arc::new(TestBackend::default());
        backend.grant(&alice(), &ns(), Action::Read);
        backend.hang.store(true, Ordering::SeqCst);
        let engine = engine(
            &backend,
            enabled().with_backend_timeout(Duration::from_millis(500)),
        );

        let err = engine.enforce(&ns(), &alice(), Action::Read).await.unwrap_err();
        assert!(err.is_backend_unavailable());
        assert!(err.to_string().contains("timed out"));

        let err = engine.update_privileges(&alice()).await.unwrap_err();
        assert!(err.is_backend_unavailable());
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn update_should_cache_empty_set() {
        let backend = Arc::new(TestBackend::default());
        let engine = engine(&backend, enabled());

        engine.update_privileges(&alice()).await.unwrap();

        assert_eq!(engine.cache().len(), 1);
        assert!(engine.cached_privileges(&alice()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoked_privileges_should_disappear_after_iteration() {
        let backend = Arc::new(TestBackend::default());
        backend.grant(&alice(), &ns(), Action::Write);
        let engine = engine(&backend, enabled());

        engine.enforce(&ns(), &alice(), Action::Write).await.unwrap();
        backend.revoke_everything(&alice());
        engine.enforce(&ns(), &alice(), Action::Write).await.unwrap();

        let report = engine.run_one_iteration().await;
        assert_eq!(report.refreshed, 1);
        assert!(engine
            .enforce(&ns(), &alice(), Action::Write)
            .await
            .unwrap_err()
            .is_permission_denied());
    }

    #[tokio::test]
    async fn invalidate_all_should_force_refetch() {
        let backend = Arc::new(TestBackend::default());
        let engine = engine(&backend, enabled());

        engine.update_privileges(&alice()).await.unwrap();
        engine.invalidate_all();
        assert!(engine.cache().is_empty());

        backend.grant(&alice(), &ns(), Action::Execute);
        engine.enforce(&ns(), &alice(), Action::Execute).await.unwrap();
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_should_refresh_in_background_until_shutdown() {
        let backend = Arc::new(TestBackend::default());
        let engine = engine(
            &backend,
            enabled().with_refresh_interval(Duration::from_secs(60)),
        );
        engine.update_privileges(&alice()).await.unwrap();

        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);

        backend.grant(&alice(), &ns(), Action::Read);
        let err = engine.enforce(&ns(), &alice(), Action::Read).await.unwrap_err();
        assert!(err.is_permission_denied());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 3);
        engine.enforce(&ns(), &alice(), Action::Read).await.unwrap();

        engine.shutdown().await;
        engine.shutdown().await;
        assert!(!engine.is_running());

        let calls = backend.list_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_shutdown_should_not_resume_refresh() {
        let backend = Arc::new(TestBackend::default());
        let engine = engine(
            &backend,
            enabled().with_refresh_interval(Duration::from_secs(10)),
        );
        engine.update_privileges(&alice()).await.unwrap();

        engine.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.shutdown().await;
        let calls = backend.list_calls.load(Ordering::SeqCst);

        assert!(matches!(engine.start(), Err(Error::Configuration(_))));
        assert!(!engine.is_running());
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn shutdown_before_start_should_prevent_refresh() {
        let backend = Arc::new(TestBackend::default());
        let engine = engine(&backend, enabled());

        engine.shutdown().await;
        assert!(engine.start().is_err());
        assert!(!engine.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_should_share_one_fetch() {
        let backend = Arc::new(TestBackend::default());
        backend.grant(&alice(), &ns(), Action::Read);
        backend.slow.store(true, Ordering::SeqCst);
        let engine = Arc::new(engine(&backend, enabled()));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..64 {
            let engine = Arc::clone(&engine);
            tasks.spawn(async move { engine.enforce(&ns(), &alice(), Action::Read).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.cache().len(), 1);
        assert!(engine.in_flight.0.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_fetch_failure_should_reach_every_waiter() {
        let backend = Arc::new(TestBackend::default());
        backend.slow.store(true, Ordering::SeqCst);
        backend.down.store(true, Ordering::SeqCst);
        let engine = engine(&backend, enabled());

        let (ns, alice) = (ns(), alice());
        let results = futures::future::join_all(
            (0..8).map(|_| engine.enforce(&ns, &alice, Action::Read)),
        )
        .await;

        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);
        for result in results {
            let err = result.unwrap_err();
            assert!(err.is_backend_unavailable());
            assert!(err.to_string().contains("connection refused"));
        }
        assert!(engine.cache().is_empty());
        assert!(engine.in_flight.0.is_empty());

        // the next miss retries
        backend.down.store(false, Ordering::SeqCst);
        let err = engine.enforce(&ns, &alice, Action::Read).await.unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn start_should_not_spawn_when_caching_inactive() {
        let backend = Arc::new(TestBackend::default());
        let engine = engine(&backend, EnforcementConfig::default());

        engine.start().unwrap();
        assert!(!engine.is_running());
    }

    #[test]
    fn start_outside_runtime_should_fail() {
        let backend = Arc::new(TestBackend::default());
        let engine = engine(&backend, enabled());

        assert!(matches!(engine.start(), Err(Error::Configuration(_))));
    }

    #[test]
    fn build_should_reject_invalid_config() {
        let result = EngineBuilder::new(TestBackend::default())
            .config(enabled().with_refresh_parallelism(0))
            .build();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
