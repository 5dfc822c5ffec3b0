//! Process-scoped registry of heavyweight resources.
//!
//! Models, tokenizers and index handles register here; the manager owns
//! their lifetime, components borrow. Eviction is LRU among idle entries and
//! runs when resident memory crosses the configured threshold. Shutdown is
//! idempotent and cancels outstanding work before releasing anything.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResourceConfig;
use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    EmbeddingModel,
    Reranker,
    Tokenizer,
    IndexHandle,
}

/// Anything whose residency the manager tracks. `release` must be idempotent
/// and tolerate concurrent callers; resources lazily reload after release.
pub trait ManagedResource: Send + Sync {
    fn resource_name(&self) -> String;
    fn kind(&self) -> ResourceKind;
    fn approx_bytes(&self) -> u64;
    fn release(&self);
}

struct Entry {
    resource: Arc<dyn ManagedResource>,
    last_used: Mutex<Instant>,
}

pub struct ResourceManager {
    config: ResourceConfig,
    entries: DashMap<String, Entry>,
    shutdown_done: AtomicBool,
    cancel: CancellationToken,
    system: Mutex<System>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> EngineResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            entries: DashMap::new(),
            shutdown_done: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            system: Mutex::new(System::new()),
        }))
    }

    /// Token cancelled when the process begins shutting down; long-running
    /// operations hang their work off child tokens of this one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn register(&self, resource: Arc<dyn ManagedResource>) {
        let name = resource.resource_name();
        debug!(resource = %name, "registering managed resource");
        self.entries.insert(
            name,
            Entry { resource, last_used: Mutex::new(Instant::now()) },
        );
    }

    pub fn touch(&self, name: &str) {
        if let Some(entry) = self.entries.get(name) {
            *entry.last_used.lock() = Instant::now();
        }
    }

    pub fn tracked_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.resource.approx_bytes()).sum()
    }

    /// Resident set size of this process in bytes, sampled via sysinfo.
    pub fn resident_memory_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    pub fn memory_threshold_bytes(&self) -> u64 {
        self.config.memory_threshold_mb * 1024 * 1024
    }

    /// True when resident memory sits above the configured threshold.
    pub fn over_threshold(&self) -> bool {
        self.resident_memory_bytes() > self.memory_threshold_bytes()
    }

    /// Evicts idle resources (LRU first) until memory drops under the
    /// threshold or no idle entries remain. Returns how many were released.
    pub fn evict_idle(&self) -> usize {
        let min_idle = Duration::from_secs(self.config.idle_eviction_secs);
        let now = Instant::now();

        let mut idle: Vec<(String, Instant)> = self
            .entries
            .iter()
            .filter_map(|e| {
                let used = *e.last_used.lock();
                (now.duration_since(used) >= min_idle).then(|| (e.key().clone(), used))
            })
            .collect();
        idle.sort_by_key(|(_, used)| *used);

        let mut released = 0;
        for (name, _) in idle {
            if !self.over_threshold() {
                break;
            }
            if let Some(entry) = self.entries.get(&name) {
                info!(resource = %name, "evicting idle resource under memory pressure");
                entry.resource.release();
                released += 1;
            }
        }
        released
    }

    /// Called before a new heavyweight allocation; frees idle resources when
    /// the process is already past its memory budget.
    pub fn prepare_for_allocation(&self) {
        if self.config.enable_gc && self.over_threshold() {
            let released = self.evict_idle();
            if released > 0 {
                debug!(released, "eviction freed resources before allocation");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_done.load(Ordering::Acquire)
    }

    /// Coordinated cleanup: cancels outstanding operations, then releases
    /// every registered resource. Safe to call more than once and from
    /// concurrent exit paths; only the first caller does the work.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(resources = self.entries.len(), "resource manager shutting down");
        self.cancel.cancel();

        for entry in self.entries.iter() {
            let name = entry.resource.resource_name();
            // Cleanup failures are logged, never propagated.
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                entry.resource.release();
            }));
            if outcome.is_err() {
                warn!(resource = %name, "resource release panicked during shutdown");
            }
        }
        self.entries.clear();
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Adapter registering an [`crate::embed::Embedder`] with the manager.
pub struct EmbedderResource {
    pub embedder: Arc<dyn crate::embed::Embedder>,
}

impl ManagedResource for EmbedderResource {
    fn resource_name(&self) -> String {
        format!("embedder:{}", self.embedder.model_info().name)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::EmbeddingModel
    }

    fn approx_bytes(&self) -> u64 {
        self.embedder.approx_bytes()
    }

    fn release(&self) {
        self.embedder.cleanup();
    }
}

/// Adapter registering a reranking strategy with the manager.
pub struct RerankerResource {
    pub name: String,
    pub reranker: Arc<dyn crate::rerank::Reranker>,
}

impl ManagedResource for RerankerResource {
    fn resource_name(&self) -> String {
        format!("reranker:{}", self.name)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Reranker
    }

    fn approx_bytes(&self) -> u64 {
        0
    }

    fn release(&self) {
        self.reranker.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> ResourceConfig {
        ResourceConfig {
            memory_threshold_mb: 64,
            cleanup_interval_ms: 5000,
            idle_eviction_secs: 0,
            enable_gc: true,
            auto_cleanup: true,
        }
    }

    struct FakeResource {
        name: String,
        releases: AtomicUsize,
    }

    impl ManagedResource for FakeResource {
        fn resource_name(&self) -> String {
            self.name.clone()
        }
        fn kind(&self) -> ResourceKind {
            ResourceKind::EmbeddingModel
        }
        fn approx_bytes(&self) -> u64 {
            1024
        }
        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn shutdown_is_idempotent_and_releases_everything() {
        let manager = ResourceManager::new(test_config()).unwrap();
        let resource = Arc::new(FakeResource {
            name: "embedder:test".into(),
            releases: AtomicUsize::new(0),
        });
        manager.register(resource.clone());

        manager.shutdown();
        manager.shutdown();
        assert_eq!(resource.releases.load(Ordering::SeqCst), 1);
        assert!(manager.is_shut_down());
        assert!(manager.cancellation_token().is_cancelled());
    }

    #[test]
    fn touch_updates_recency() {
        let manager = ResourceManager::new(test_config()).unwrap();
        let resource = Arc::new(FakeResource {
            name: "embedder:recency".into(),
            releases: AtomicUsize::new(0),
        });
        manager.register(resource.clone());
        manager.touch("embedder:recency");
        assert_eq!(manager.tracked_bytes(), 1024);
    }

    #[test]
    fn config_validation_gates_construction() {
        let bad = ResourceConfig { memory_threshold_mb: 1, ..test_config() };
        assert!(ResourceManager::new(bad).is_err());
    }
}
