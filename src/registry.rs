//! Resource registry for orderly shutdown.
//!
//! Every component that owns an external resource (browser session, OCR
//! engine, HTTP client, open evidence writer) registers here. On
//! cancellation, escalation, or normal completion the registry drives
//! `cleanup()` on every still-live resource concurrently, with a
//! per-resource timeout, and reports the outcome.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default per-resource cleanup timeout.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// A component instance owning an external resource.
///
/// `cleanup` must be idempotent: a second call after a successful first
/// one is a no-op.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Release the underlying resource.
    async fn cleanup(&self) -> Result<()>;

    /// Whether cleanup has already completed.
    fn is_cleaned_up(&self) -> bool;
}

/// Handle returned by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

/// Outcome of a registry shutdown pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Resources that cleaned up in time
    pub succeeded: usize,
    /// Resources whose cleanup returned an error
    pub failed: usize,
    /// Resources that exceeded the cleanup timeout and were abandoned
    pub abandoned: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.abandoned
    }
}

/// Tracks live resources and drives their cleanup.
pub struct ResourceRegistry {
    next_id: AtomicU64,
    resources: RwLock<HashMap<u64, Arc<dyn Resource>>>,
    shutting_down: AtomicBool,
    cleanup_timeout: Duration,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::with_cleanup_timeout(DEFAULT_CLEANUP_TIMEOUT)
    }

    pub fn with_cleanup_timeout(cleanup_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            resources: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            cleanup_timeout,
        }
    }

    /// Register a resource. Refused once shutdown has begun.
    pub async fn register(&self, resource: Arc<dyn Resource>) -> Result<ResourceId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "registry is shutting down; refusing registration of '{}'",
                resource.name()
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut resources = self.resources.write().await;
        debug!(resource = resource.name(), id, "resource registered");
        resources.insert(id, resource);
        Ok(ResourceId(id))
    }

    /// Remove a resource without cleaning it up (ownership moved back to
    /// the caller).
    pub async fn unregister(&self, id: ResourceId) -> Option<Arc<dyn Resource>> {
        let mut resources = self.resources.write().await;
        resources.remove(&id.0)
    }

    /// Number of currently registered resources.
    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }

    /// Whether shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Clean up every still-live resource concurrently.
    ///
    /// Idempotent: a second call finds no live resources. A resource
    /// that exceeds the per-resource timeout is abandoned; its failure
    /// is logged but does not block the rest of shutdown.
    pub async fn shutdown(&self) -> CleanupReport {
        self.shutting_down.store(true, Ordering::SeqCst);

        // Snapshot under the lock, clean up outside it.
        let snapshot: Vec<(u64, Arc<dyn Resource>)> = {
            let mut resources = self.resources.write().await;
            resources.drain().collect()
        };

        if snapshot.is_empty() {
            return CleanupReport::default();
        }

        let timeout = self.cleanup_timeout;
        let outcomes = join_all(snapshot.into_iter().map(|(id, resource)| async move {
            if resource.is_cleaned_up() {
                return (id, resource, CleanupOutcome::Succeeded);
            }
            match tokio::time::timeout(timeout, resource.cleanup()).await {
                Ok(Ok(())) => (id, resource, CleanupOutcome::Succeeded),
                Ok(Err(err)) => (id, resource, CleanupOutcome::Failed(err.to_string())),
                Err(_) => (id, resource, CleanupOutcome::Abandoned),
            }
        }))
        .await;

        let mut report = CleanupReport::default();
        for (id, resource, outcome) in outcomes {
            match outcome {
                CleanupOutcome::Succeeded => report.succeeded += 1,
                CleanupOutcome::Failed(message) => {
                    warn!(resource = resource.name(), id, %message, "resource cleanup failed");
                    report.failed += 1;
                }
                CleanupOutcome::Abandoned => {
                    warn!(
                        resource = resource.name(),
                        id,
                        timeout_ms = timeout.as_millis() as u64,
                        "resource cleanup timed out; abandoned"
                    );
                    report.abandoned += 1;
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            "registry shutdown complete"
        );
        report
    }
}

enum CleanupOutcome {
    Succeeded,
    Failed(String),
    Abandoned,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestResource {
        name: String,
        cleaned: AtomicBool,
        cleanup_calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl TestResource {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                cleaned: AtomicBool::new(false),
                cleanup_calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                fail: true,
                ..Self::new(name)
            }
        }

        fn slow(name: &str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(name)
            }
        }
    }

    #[async_trait]
    impl Resource for TestResource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn cleanup(&self) -> Result<()> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(Error::Internal("cleanup exploded".to_string()));
            }
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_cleaned_up(&self) -> bool {
            self.cleaned.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_register_and_shutdown() {
        let registry = ResourceRegistry::new();
        let a = Arc::new(TestResource::new("browser"));
        let b = Arc::new(TestResource::new("ocr"));
        registry.register(a.clone()).await.unwrap();
        registry.register(b.clone()).await.unwrap();
        assert_eq!(registry.len().await, 2);

        let report = registry.shutdown().await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.total(), 2);
        assert!(a.is_cleaned_up());
        assert!(b.is_cleaned_up());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_registration_refused_during_shutdown() {
        let registry = ResourceRegistry::new();
        registry.shutdown().await;

        let late = Arc::new(TestResource::new("late"));
        assert!(registry.register(late).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_cleanup_does_not_block_others() {
        let registry = ResourceRegistry::new();
        let good = Arc::new(TestResource::new("good"));
        let bad = Arc::new(TestResource::failing("bad"));
        registry.register(good.clone()).await.unwrap();
        registry.register(bad).await.unwrap();

        let report = registry.shutdown().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(good.is_cleaned_up());
    }

    #[tokio::test]
    async fn test_slow_cleanup_is_abandoned() {
        let registry = ResourceRegistry::with_cleanup_timeout(Duration::from_millis(20));
        let slow = Arc::new(TestResource::slow("slow", Duration::from_secs(5)));
        registry.register(slow).await.unwrap();

        let report = registry.shutdown().await;
        assert_eq!(report.abandoned, 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let registry = ResourceRegistry::new();
        let resource = Arc::new(TestResource::new("one"));
        registry.register(resource.clone()).await.unwrap();

        let first = registry.shutdown().await;
        assert_eq!(first.succeeded, 1);

        let second = registry.shutdown().await;
        assert_eq!(second.total(), 0);
        assert_eq!(resource.cleanup_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cleaned_resource_is_not_recleaned() {
        let registry = ResourceRegistry::new();
        let resource = Arc::new(TestResource::new("pre-cleaned"));
        resource.cleanup().await.unwrap();
        registry.register(resource.clone()).await.unwrap();

        let report = registry.shutdown().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(resource.cleanup_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_without_cleanup() {
        let registry = ResourceRegistry::new();
        let resource = Arc::new(TestResource::new("moved"));
        let id = registry.register(resource.clone()).await.unwrap();

        let taken = registry.unregister(id).await;
        assert!(taken.is_some());
        assert!(registry.is_empty().await);
        assert!(!resource.is_cleaned_up());
    }
}
