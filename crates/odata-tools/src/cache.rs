//! Catalog cache.
//!
//! One immutable [`CatalogSnapshot`] per service identity. Readers clone an `Arc` under a short
//! read lock; refresh builds a complete new snapshot off-lock and swaps the pointer. A failed
//! refresh keeps the previous snapshot.

use crate::catalog::{OperationDescriptor, synthesize};
use crate::config::{AuthConfig, ServiceConfig, ToolProfile};
use crate::error::{ODataToolsError, Result};
use crate::metadata::parse_metadata_bytes;
use crate::model::Model;
use crate::runtime::{ODATA_VERSION, apply_auth};
use crate::safety::{OutboundHttpSafety, redact_url, sanitize_reqwest_error};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::Digest as _;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Where metadata documents come from.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Human-readable location, for logs and errors.
    fn location(&self) -> String;

    /// Fetch the raw metadata document.
    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// Fetches `$metadata` over HTTP.
pub struct HttpMetadataSource {
    url: Url,
    client: reqwest::Client,
    auth: Option<AuthConfig>,
    headers: BTreeMap<String, String>,
    timeout: Option<Duration>,
    safety: OutboundHttpSafety,
}

impl HttpMetadataSource {
    /// # Errors
    ///
    /// Returns an error if `url` is not a valid URL or the HTTP client cannot be built.
    pub fn new(
        url: &str,
        config: &ServiceConfig,
        timeout: Option<Duration>,
        safety: OutboundHttpSafety,
    ) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| ODataToolsError::Config(format!("invalid metadata URL '{url}': {e}")))?;
        let client = safety.build_client()?;
        Ok(Self {
            url,
            client,
            auth: config.auth.clone(),
            headers: config.headers.clone(),
            timeout,
            safety,
        })
    }

    fn fetch_error(&self, message: impl Into<String>) -> ODataToolsError {
        ODataToolsError::MetadataFetch {
            url: redact_url(&self.url),
            message: message.into(),
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    fn location(&self) -> String {
        redact_url(&self.url)
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        self.safety
            .check_url(&self.url)
            .await
            .map_err(|e| self.fetch_error(e.to_string()))?;

        let mut request = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "application/xml")
            .header("OData-MaxVersion", ODATA_VERSION);
        request = apply_auth(self.auth.as_ref(), request);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.fetch_error(sanitize_reqwest_error(&e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.fetch_error(format!("service returned {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.fetch_error(sanitize_reqwest_error(&e)))?;
        Ok(bytes.to_vec())
    }
}

/// Reads metadata from disk.
pub struct FileMetadataSource {
    path: PathBuf,
}

impl FileMetadataSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MetadataSource for FileMetadataSource {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| ODataToolsError::MetadataFetch {
                url: self.location(),
                message: e.to_string(),
            })
    }
}

/// Pick the metadata source a service config describes (`metadataFile` wins).
///
/// # Errors
///
/// Returns an error if no location is configured or the URL is invalid.
pub fn metadata_source(
    config: &ServiceConfig,
    timeout: Option<Duration>,
    safety: OutboundHttpSafety,
) -> Result<Arc<dyn MetadataSource>> {
    if let Some(path) = &config.metadata_file {
        return Ok(Arc::new(FileMetadataSource::new(path.clone())));
    }
    let url = config.metadata_location().ok_or_else(|| {
        ODataToolsError::Config("no metadata location configured".to_string())
    })?;
    Ok(Arc::new(HttpMetadataSource::new(&url, config, timeout, safety)?))
}

/// A parsed model and its operation catalog. Never mutated once built.
#[derive(Debug)]
pub struct CatalogSnapshot {
    pub model: Model,
    pub operations: Vec<OperationDescriptor>,
    /// Hex sha256 of the metadata document.
    pub fingerprint: String,
    pub loaded_at: SystemTime,
}

impl CatalogSnapshot {
    /// Parse and synthesize in one step.
    ///
    /// # Errors
    ///
    /// Returns the parse or synthesis error; no partial snapshot is produced.
    pub fn build(document: &[u8], profile: &ToolProfile) -> Result<Self> {
        let model = parse_metadata_bytes(document)?;
        let operations = synthesize(&model, profile)?;
        Ok(Self {
            model,
            operations,
            fingerprint: fingerprint(document),
            loaded_at: SystemTime::now(),
        })
    }

    #[must_use]
    pub fn operation(&self, name: &str) -> Option<&OperationDescriptor> {
        self.operations.iter().find(|o| o.name == name)
    }
}

#[must_use]
pub fn fingerprint(document: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(document))
}

struct EntryState {
    snapshot: Option<Arc<CatalogSnapshot>>,
    checked_at: Instant,
    /// Generation of the fetch that produced `snapshot`.
    applied: u64,
}

struct Entry {
    service: String,
    source: Arc<dyn MetadataSource>,
    profile: ToolProfile,
    ttl: Duration,
    state: RwLock<EntryState>,
    refreshing: AtomicBool,
    /// Bumped when a fetch starts. A fetch older than the applied one never swaps.
    generation: AtomicU64,
}

impl Entry {
    fn current(&self) -> Option<Arc<CatalogSnapshot>> {
        self.state.read().snapshot.clone()
    }

    fn touch(&self) {
        self.state.write().checked_at = Instant::now();
    }

    async fn refresh(&self) -> Result<Arc<CatalogSnapshot>> {
        let result = self.rebuild().await;
        if result.is_err() {
            self.touch();
        }
        result
    }

    async fn rebuild(&self) -> Result<Arc<CatalogSnapshot>> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let document = self.source.fetch().await?;

        let current = self.current();
        if let Some(current) = current
            && current.fingerprint == fingerprint(&document)
        {
            debug!(service = %self.service, "metadata unchanged; keeping catalog");
            self.touch();
            return Ok(current);
        }

        let snapshot = Arc::new(CatalogSnapshot::build(&document, &self.profile)?);
        {
            let mut state = self.state.write();
            if generation < state.applied
                && let Some(newer) = &state.snapshot
            {
                debug!(
                    service = %self.service,
                    generation,
                    applied = state.applied,
                    "discarding catalog from an older fetch"
                );
                return Ok(Arc::clone(newer));
            }
            state.snapshot = Some(Arc::clone(&snapshot));
            state.applied = generation;
            state.checked_at = Instant::now();
        }
        info!(
            service = %self.service,
            source = %self.source.location(),
            operations = snapshot.operations.len(),
            "catalog loaded"
        );
        Ok(snapshot)
    }
}

/// Catalogs keyed by service identity.
///
/// Background work spawned by the cache (stale-triggered and periodic refreshes) stops once
/// [`CatalogCache::shutdown`] is called.
#[derive(Clone)]
pub struct CatalogCache {
    inner: Arc<RwLock<HashMap<String, Arc<Entry>>>>,
    shutdown: CancellationToken,
}

impl Default for CatalogCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel every refresh this cache has spawned, including fetches in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Register (or replace) a service. Nothing is fetched until the first lookup.
    pub fn register(
        &self,
        service: impl Into<String>,
        source: Arc<dyn MetadataSource>,
        profile: ToolProfile,
        ttl: Duration,
    ) {
        let service = service.into();
        let entry = Arc::new(Entry {
            service: service.clone(),
            source,
            profile,
            ttl,
            state: RwLock::new(EntryState {
                snapshot: None,
                checked_at: Instant::now(),
                applied: 0,
            }),
            refreshing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });
        self.inner.write().insert(service, entry);
    }

    fn entry(&self, service: &str) -> Result<Arc<Entry>> {
        self.inner
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| ODataToolsError::Config(format!("unknown service '{service}'")))
    }

    /// The current snapshot without triggering any I/O.
    #[must_use]
    pub fn current(&self, service: &str) -> Option<Arc<CatalogSnapshot>> {
        self.entry(service).ok()?.current()
    }

    /// Return the catalog for `service`.
    ///
    /// The first call loads synchronously and propagates failures. Afterwards the cached snapshot
    /// is returned immediately; once it is older than the TTL a background refresh is started,
    /// and a failed refresh only logs.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown service or a failed initial load.
    pub async fn get_catalog(&self, service: &str) -> Result<Arc<CatalogSnapshot>> {
        let entry = self.entry(service)?;
        let (snapshot, stale) = {
            let state = entry.state.read();
            (state.snapshot.clone(), state.checked_at.elapsed() >= entry.ttl)
        };

        let Some(snapshot) = snapshot else {
            return entry.refresh().await;
        };

        if stale && !self.is_shut_down() && !entry.refreshing.swap(true, Ordering::AcqRel) {
            let entry = Arc::clone(&entry);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        debug!(service = %entry.service, "background catalog refresh cancelled");
                    }
                    result = entry.refresh() => {
                        if let Err(e) = result {
                            warn!(
                                service = %entry.service,
                                error = %e,
                                "catalog refresh failed; serving previous catalog"
                            );
                        }
                    }
                }
                entry.refreshing.store(false, Ordering::Release);
            });
        }
        Ok(snapshot)
    }

    /// Refresh now and wait for the result. The previous snapshot is kept on failure.
    ///
    /// # Errors
    ///
    /// Returns the fetch, parse or synthesis error.
    pub async fn refresh_now(&self, service: &str) -> Result<Arc<CatalogSnapshot>> {
        self.entry(service)?.refresh().await
    }

    /// Periodically refresh `service` until `cancel` fires or the cache shuts down. A refresh in
    /// flight is abandoned on cancellation.
    #[must_use]
    pub fn start_refresh_task(
        &self,
        service: impl Into<String>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        let service = service.into();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = shutdown.cancelled() => break,
                    result = cache.refresh_now(&service) => {
                        if let Err(e) = result {
                            warn!(
                                service = %service,
                                error = %e,
                                "scheduled catalog refresh failed; serving previous catalog"
                            );
                        }
                    }
                }
            }
            debug!(service = %service, "catalog refresh task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    const NORTHWIND: &str = include_str!("../../test-support/fixtures/northwind.xml");

    /// Serves scripted documents; repeats the last script entry once the queue drains.
    struct ScriptedSource {
        script: Mutex<VecDeque<std::result::Result<String, String>>>,
        last: Mutex<std::result::Result<String, String>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<std::result::Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Err("no script".to_string())),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MetadataSource for ScriptedSource {
        fn location(&self) -> String {
            "scripted".to_string()
        }

        async fn fetch(&self) -> Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            let item = match next {
                Some(item) => {
                    *self.last.lock() = item.clone();
                    item
                }
                None => self.last.lock().clone(),
            };
            item.map(String::into_bytes)
                .map_err(|message| ODataToolsError::MetadataFetch {
                    url: "scripted".to_string(),
                    message,
                })
        }
    }

    fn with_shippers() -> String {
        NORTHWIND.replace(
            "<Singleton Name=\"Company\"",
            "<EntitySet Name=\"Shippers\" EntityType=\"NorthwindModel.Category\"/>\n        <Singleton Name=\"Company\"",
        )
    }

    #[tokio::test]
    async fn initial_load_failure_propagates() {
        let cache = CatalogCache::new();
        cache.register(
            "nw",
            ScriptedSource::new(vec![Err("connection refused".to_string())]),
            ToolProfile::default(),
            Duration::from_secs(60),
        );
        let err = cache.get_catalog("nw").await.unwrap_err();
        assert!(matches!(err, ODataToolsError::MetadataFetch { .. }));
        assert!(cache.current("nw").is_none());
    }

    #[tokio::test]
    async fn unknown_service_is_an_error() {
        let cache = CatalogCache::new();
        assert!(cache.get_catalog("missing").await.is_err());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_catalog() {
        let cache = CatalogCache::new();
        let source = ScriptedSource::new(vec![
            Ok(NORTHWIND.to_string()),
            Err("service unavailable".to_string()),
        ]);
        cache.register("nw", source.clone(), ToolProfile::default(), Duration::ZERO);

        let first = cache.get_catalog("nw").await.unwrap();
        assert!(!first.operations.is_empty());

        // Stale: this lookup serves the cached snapshot and starts a background refresh.
        let second = cache.get_catalog("nw").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        for _ in 0..100 {
            if source.fetches.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source.fetches.load(Ordering::SeqCst) >= 2);

        assert!(cache.refresh_now("nw").await.is_err());
        let third = cache.get_catalog("nw").await.unwrap();
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn unchanged_metadata_keeps_snapshot_and_changes_swap_it() {
        let cache = CatalogCache::new();
        let source = ScriptedSource::new(vec![
            Ok(NORTHWIND.to_string()),
            Ok(NORTHWIND.to_string()),
            Ok(with_shippers()),
        ]);
        cache.register("nw", source, ToolProfile::default(), Duration::from_secs(3600));

        let first = cache.get_catalog("nw").await.unwrap();
        let same = cache.refresh_now("nw").await.unwrap();
        assert!(Arc::ptr_eq(&first, &same));

        let changed = cache.refresh_now("nw").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &changed));
        assert_ne!(first.fingerprint, changed.fingerprint);
        assert!(changed.operation("ListShippers").is_some());
        assert!(first.operation("ListShippers").is_none());
        assert!(Arc::ptr_eq(&cache.current("nw").unwrap(), &changed));
    }

    #[tokio::test]
    async fn refresh_task_stops_on_cancel() {
        let cache = CatalogCache::new();
        let source = ScriptedSource::new(vec![Ok(NORTHWIND.to_string())]);
        cache.register("nw", source.clone(), ToolProfile::default(), Duration::from_secs(3600));

        let cancel = CancellationToken::new();
        let handle = cache.start_refresh_task("nw", Duration::from_millis(5), cancel.clone());
        for _ in 0..100 {
            if cache.current("nw").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.current("nw").is_some());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("task exits")
            .expect("task join");
    }

    /// First fetch succeeds; every later fetch never completes.
    struct HangingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MetadataSource for HangingSource {
        fn location(&self) -> String {
            "hanging".to_string()
        }

        async fn fetch(&self) -> Result<Vec<u8>> {
            if self.fetches.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(NORTHWIND.as_bytes().to_vec());
            }
            std::future::pending().await
        }
    }

    /// Each fetch serves the next document, optionally holding it until a gate opens.
    struct GatedSource {
        script: Mutex<VecDeque<(Option<tokio::sync::oneshot::Receiver<()>>, String)>>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MetadataSource for GatedSource {
        fn location(&self) -> String {
            "gated".to_string()
        }

        async fn fetch(&self) -> Result<Vec<u8>> {
            let (gate, document) = self
                .script
                .lock()
                .pop_front()
                .unwrap_or((None, NORTHWIND.to_string()));
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(document.into_bytes())
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn refresh_task_abandons_a_fetch_that_never_completes() {
        let cache = CatalogCache::new();
        let source = Arc::new(HangingSource {
            fetches: AtomicUsize::new(0),
        });
        cache.register("nw", source.clone(), ToolProfile::default(), Duration::from_secs(3600));

        let cancel = CancellationToken::new();
        let handle = cache.start_refresh_task("nw", Duration::from_millis(5), cancel.clone());
        wait_for(|| source.fetches.load(Ordering::SeqCst) >= 2).await;
        assert!(cache.current("nw").is_some());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task exits while its fetch is pending")
            .expect("task join");
    }

    #[tokio::test]
    async fn cache_shutdown_stops_periodic_and_background_refreshes() {
        let cache = CatalogCache::new();
        let source = Arc::new(HangingSource {
            fetches: AtomicUsize::new(0),
        });
        cache.register("nw", source.clone(), ToolProfile::default(), Duration::ZERO);

        let first = cache.get_catalog("nw").await.unwrap();
        // Stale at once: this starts a background refresh that hangs in fetch.
        let second = cache.get_catalog("nw").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let entry = cache.entry("nw").unwrap();
        wait_for(|| source.fetches.load(Ordering::SeqCst) >= 2).await;
        assert!(entry.refreshing.load(Ordering::SeqCst));

        let periodic =
            cache.start_refresh_task("nw", Duration::from_millis(5), CancellationToken::new());

        cache.shutdown();
        wait_for(|| !entry.refreshing.load(Ordering::SeqCst)).await;
        tokio::time::timeout(Duration::from_secs(1), periodic)
            .await
            .expect("periodic task exits on shutdown")
            .expect("task join");

        // No new background work after shutdown; the snapshot keeps serving.
        let fetches = source.fetches.load(Ordering::SeqCst);
        let third = cache.get_catalog("nw").await.unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), fetches);
    }

    #[tokio::test]
    async fn older_fetch_never_replaces_a_newer_catalog() {
        let (release, gate) = tokio::sync::oneshot::channel();
        let source = Arc::new(GatedSource {
            script: Mutex::new(
                vec![
                    (None, NORTHWIND.to_string()),
                    (Some(gate), format!("{NORTHWIND}\n")),
                    (None, with_shippers()),
                ]
                .into(),
            ),
            fetches: AtomicUsize::new(0),
        });
        let cache = CatalogCache::new();
        cache.register("nw", source.clone(), ToolProfile::default(), Duration::from_secs(3600));
        cache.get_catalog("nw").await.unwrap();

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh_now("nw").await })
        };
        wait_for(|| source.fetches.load(Ordering::SeqCst) >= 2).await;

        let fast = cache.refresh_now("nw").await.unwrap();
        assert!(fast.operation("ListShippers").is_some());

        release.send(()).unwrap();
        let from_slow = slow.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&from_slow, &fast));
        let current = cache.current("nw").unwrap();
        assert!(Arc::ptr_eq(&current, &fast));
    }

    #[tokio::test]
    async fn file_source_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.xml");
        std::fs::write(&path, NORTHWIND).unwrap();

        let source = FileMetadataSource::new(&path);
        let bytes = source.fetch().await.unwrap();
        assert_eq!(fingerprint(&bytes), fingerprint(NORTHWIND.as_bytes()));

        let missing = FileMetadataSource::new(dir.path().join("nope.xml"));
        assert!(matches!(
            missing.fetch().await,
            Err(ODataToolsError::MetadataFetch { .. })
        ));
    }
}
