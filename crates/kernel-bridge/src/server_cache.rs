//! Deduplicated server creation.
//!
//! Concurrent requests for the same server share one in-flight creation.
//! A failed creation is forgotten straight away so the next request retries,
//! and disposing a server evicts it so it is never handed out again.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::KernelError;
use crate::session_manager::SessionManager;

/// How long global disposal waits for each server.
const DISPOSE_GRACE: Duration = Duration::from_secs(1);

/// A server the cache can tear down. `dispose` may be called more than once.
#[async_trait]
pub trait DisposableServer: Send + Sync + 'static {
    async fn dispose(&self);
}

#[async_trait]
impl DisposableServer for SessionManager {
    async fn dispose(&self) {
        SessionManager::dispose(self).await;
    }
}

/// What identifies a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// Remote server URI; `None` for a server on this machine.
    pub uri: Option<String>,
    pub use_default_config: bool,
    pub local_launch: bool,
    pub working_directory: Option<PathBuf>,
}

impl ServerOptions {
    pub fn cache_key(&self) -> String {
        let uri = self
            .uri
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/').to_lowercase())
            .unwrap_or_else(|| "local".to_string());
        let working_directory = self
            .working_directory
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}",
            uri, self.use_default_config, self.local_launch, working_directory
        )
    }
}

type ServerFuture<S> = Shared<BoxFuture<'static, Result<Arc<S>, KernelError>>>;

struct Entry<S> {
    generation: u64,
    future: ServerFuture<S>,
}

struct Entries<S> {
    map: Mutex<HashMap<String, Entry<S>>>,
    next_generation: AtomicU64,
}

impl<S> Entries<S> {
    /// Remove `key` only if it still holds the given generation.
    fn evict(&self, key: &str, generation: u64) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(key).is_some_and(|e| e.generation == generation) {
            map.remove(key);
            debug!("[server-cache] Evicted {}", key);
        }
    }
}

/// A server handed out by [`ServerCache`].
pub struct ServerHandle<S: DisposableServer> {
    server: Arc<S>,
    key: String,
    generation: u64,
    entries: Weak<Entries<S>>,
    disposed: AtomicBool,
}

impl<S: DisposableServer> ServerHandle<S> {
    pub fn server(&self) -> &Arc<S> {
        &self.server
    }

    /// Evict the server from the cache, then dispose it.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(entries) = self.entries.upgrade() {
            entries.evict(&self.key, self.generation);
        }
        self.server.dispose().await;
    }
}

impl<S: DisposableServer> std::ops::Deref for ServerHandle<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.server
    }
}

pub struct ServerCache<S> {
    entries: Arc<Entries<S>>,
}

impl<S> Default for ServerCache<S> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Entries {
                map: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }
}

impl<S: DisposableServer> ServerCache<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The server for `options`, created with `create` if there is none.
    ///
    /// `create` runs at most once per key while its result is cached or in
    /// flight. Cancelling a caller does not abandon the creation; later
    /// callers pick it up.
    pub async fn get_or_create<F, Fut>(
        &self,
        create: F,
        options: &ServerOptions,
        cancel: &CancellationToken,
    ) -> Result<ServerHandle<S>, KernelError>
    where
        F: FnOnce(ServerOptions) -> Fut,
        Fut: Future<Output = Result<S, KernelError>> + Send + 'static,
    {
        let key = options.cache_key();
        let (future, generation) = {
            let mut map = self
                .entries
                .map
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match map.get(&key) {
                Some(entry) => (entry.future.clone(), entry.generation),
                None => {
                    let generation = self.entries.next_generation.fetch_add(1, Ordering::SeqCst);
                    debug!("[server-cache] Creating server for {}", key);
                    let future = create(options.clone())
                        .map(|result| result.map(Arc::new))
                        .boxed()
                        .shared();
                    map.insert(
                        key.clone(),
                        Entry {
                            generation,
                            future: future.clone(),
                        },
                    );
                    (future, generation)
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(KernelError::Cancelled),
            result = future => result,
        };

        match result {
            Ok(server) => Ok(ServerHandle {
                server,
                key,
                generation,
                entries: Arc::downgrade(&self.entries),
                disposed: AtomicBool::new(false),
            }),
            Err(e) => {
                warn!("[server-cache] Creating server for {} failed: {}", key, e);
                self.entries.evict(&key, generation);
                Err(e)
            }
        }
    }

    /// Forget every server and dispose each one, giving each a short grace
    /// period. Slow disposals keep running in the background.
    pub async fn dispose(&self) {
        let entries: Vec<(String, Entry<S>)> = self
            .entries
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if entries.is_empty() {
            return;
        }
        info!("[server-cache] Disposing {} servers", entries.len());

        for (key, entry) in entries {
            let task = tokio::spawn(async move {
                if let Ok(server) = entry.future.await {
                    server.dispose().await;
                }
            });
            if tokio::time::timeout(DISPOSE_GRACE, task).await.is_err() {
                warn!(
                    "[server-cache] Server {} still disposing after {:?}, not waiting",
                    key, DISPOSE_GRACE
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;

    #[derive(Default)]
    struct FakeServer {
        slow_dispose: bool,
        disposes: AtomicUsize,
    }

    #[async_trait]
    impl DisposableServer for FakeServer {
        async fn dispose(&self) {
            if self.slow_dispose {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.disposes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn remote(uri: &str) -> ServerOptions {
        ServerOptions {
            uri: Some(uri.to_string()),
            ..Default::default()
        }
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
    ) -> impl FnOnce(ServerOptions) -> BoxFuture<'static, Result<FakeServer, KernelError>> {
        let calls = calls.clone();
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(FakeServer::default())
            }
            .boxed()
        }
    }

    #[test]
    fn test_cache_key_normalizes_uri() {
        assert_eq!(
            remote("http://Host:8888/").cache_key(),
            remote("http://host:8888").cache_key()
        );
        let mut with_dir = remote("http://host:8888");
        with_dir.working_directory = Some(PathBuf::from("/work"));
        assert_ne!(with_dir.cache_key(), remote("http://host:8888").cache_key());
        assert_eq!(ServerOptions::default().cache_key(), "local|false|false|");
    }

    #[tokio::test]
    async fn test_concurrent_requests_create_once() {
        let cache = ServerCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let options = remote("http://host:8888");
        let shouted = remote("http://HOST:8888/");

        let (a, b) = tokio::join!(
            cache.get_or_create(counting(&calls), &options, &cancel),
            cache.get_or_create(counting(&calls), &shouted, &cancel),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(a.unwrap().server(), b.unwrap().server()));
    }

    #[tokio::test]
    async fn test_distinct_keys_create_separately() {
        let cache = ServerCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        cache
            .get_or_create(counting(&calls), &remote("http://a:8888"), &cancel)
            .await
            .unwrap();
        cache
            .get_or_create(counting(&calls), &remote("http://b:8888"), &cancel)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_evicted() {
        let cache: ServerCache<FakeServer> = ServerCache::new();
        let cancel = CancellationToken::new();
        let options = remote("http://host:8888");

        let failed = cache
            .get_or_create(
                |_| async { Err(KernelError::Connection("refused".into())) },
                &options,
                &cancel,
            )
            .await;
        assert!(matches!(failed, Err(KernelError::Connection(_))));
        assert!(cache.is_empty());

        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_create(counting(&calls), &options, &cancel)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disposing_handle_evicts_entry() {
        let cache = ServerCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let options = remote("http://host:8888");

        let first = cache
            .get_or_create(counting(&calls), &options, &cancel)
            .await
            .unwrap();
        first.dispose().await;
        first.dispose().await;
        assert_eq!(first.disposes.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        let second = cache
            .get_or_create(counting(&calls), &options, &cancel)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(first.server(), second.server()));
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_evict_newer_server() {
        let cache = ServerCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let options = remote("http://host:8888");

        let old_a = cache
            .get_or_create(counting(&calls), &options, &cancel)
            .await
            .unwrap();
        let old_b = cache
            .get_or_create(counting(&calls), &options, &cancel)
            .await
            .unwrap();
        old_a.dispose().await;
        let current = cache
            .get_or_create(counting(&calls), &options, &cancel)
            .await
            .unwrap();

        old_b.dispose().await;

        let again = cache
            .get_or_create(counting(&calls), &options, &cancel)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(current.server(), again.server()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_caller_leaves_creation_for_others() {
        let cache = ServerCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let options = remote("http://host:8888");
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        let result = cache
            .get_or_create(counting(&calls), &options, &cancelled)
            .await;
        assert!(matches!(result, Err(KernelError::Cancelled)));

        cache
            .get_or_create(counting(&calls), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_does_not_wait_for_slow_servers() {
        let cache = ServerCache::new();
        let cancel = CancellationToken::new();
        let slow = cache
            .get_or_create(
                |_| async {
                    Ok(FakeServer {
                        slow_dispose: true,
                        ..Default::default()
                    })
                },
                &remote("http://slow:8888"),
                &cancel,
            )
            .await
            .unwrap();
        let fast = cache
            .get_or_create(
                |_| async { Ok(FakeServer::default()) },
                &remote("http://fast:8888"),
                &cancel,
            )
            .await
            .unwrap();

        let started = Instant::now();
        cache.dispose().await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(cache.is_empty());
        assert_eq!(fast.disposes.load(Ordering::SeqCst), 1);
        assert_eq!(slow.disposes.load(Ordering::SeqCst), 0);
    }
}
