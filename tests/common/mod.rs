//! Shared test doubles for the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use layercast::cache::blob::BlobLayer;
use layercast::cache::layer::LayerStats;
use layercast::cache::prediction::{AccessFeatures, LayerPrediction, TrainedModel};
use layercast::cache::structured::StructuredLayer;
use layercast::cache::volatile::VolatileLayer;
use layercast::{CacheConfig, CacheEntry, CacheManager, LayerAdapter, LayerId};

/// Adapter calls seen by every `FaultyLayer` sharing one log
pub type CallLog = Arc<Mutex<Vec<(LayerId, &'static str)>>>;

/// Wraps a real layer and injects outages, hangs and slow writes
pub struct FaultyLayer {
    inner: Arc<dyn LayerAdapter>,
    down: AtomicBool,
    hang: AtomicBool,
    write_delay_ms: AtomicU64,
    sets_started: AtomicU64,
    log: CallLog,
}

impl FaultyLayer {
    pub fn new(inner: Arc<dyn LayerAdapter>, log: CallLog) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
            sets_started: AtomicU64::new(0),
            log,
        }
    }

    /// Medium unreachable: `is_available` is false and every call fails
    pub fn crash(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
        self.hang.store(false, Ordering::SeqCst);
    }

    /// Calls never return
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn slow_writes(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// `set` calls that reached this adapter
    pub fn sets_started(&self) -> u64 {
        self.sets_started.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> bool {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        !self.down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LayerAdapter for FaultyLayer {
    fn id(&self) -> LayerId {
        self.inner.id()
    }

    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.log.lock().push((self.id(), "get"));
        if !self.gate().await {
            return None;
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> bool {
        self.sets_started.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push((self.id(), "set"));
        if !self.gate().await {
            return false;
        }
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.set(key, entry).await
    }

    async fn delete(&self, key: &str) -> bool {
        self.log.lock().push((self.id(), "delete"));
        if !self.gate().await {
            return false;
        }
        self.inner.delete(key).await
    }

    async fn list_all(&self) -> HashMap<String, CacheEntry> {
        if !self.gate().await {
            return HashMap::new();
        }
        self.inner.list_all().await
    }

    fn is_available(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    fn max_entry_size(&self) -> u64 {
        self.inner.max_entry_size()
    }

    fn stats(&self) -> LayerStats {
        self.inner.stats()
    }
}

/// Three in-memory layers behind fault injectors
pub struct Harness {
    pub volatile: Arc<FaultyLayer>,
    pub structured: Arc<FaultyLayer>,
    pub blob: Arc<FaultyLayer>,
    pub log: CallLog,
}

impl Harness {
    pub fn new() -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        Self {
            volatile: Arc::new(FaultyLayer::new(Arc::new(VolatileLayer::new()), log.clone())),
            structured: Arc::new(FaultyLayer::new(Arc::new(StructuredLayer::in_memory()), log.clone())),
            blob: Arc::new(FaultyLayer::new(Arc::new(BlobLayer::in_memory()), log.clone())),
            log,
        }
    }

    pub fn layers(&self) -> Vec<Arc<dyn LayerAdapter>> {
        vec![
            self.volatile.clone() as Arc<dyn LayerAdapter>,
            self.structured.clone() as Arc<dyn LayerAdapter>,
            self.blob.clone() as Arc<dyn LayerAdapter>,
        ]
    }

    pub fn layer(&self, id: LayerId) -> &Arc<FaultyLayer> {
        match id {
            LayerId::Volatile => &self.volatile,
            LayerId::Structured => &self.structured,
            LayerId::Blob => &self.blob,
        }
    }

    pub fn cache(&self) -> CacheManager {
        self.cache_with(CacheConfig::in_memory())
    }

    pub fn cache_with(&self, mut config: CacheConfig) -> CacheManager {
        config.sync.layer_timeout = Duration::from_millis(100);
        CacheManager::with_layers(config, self.layers()).unwrap()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Layers read by `get`, in call order
    pub fn reads(&self) -> Vec<LayerId> {
        self.log
            .lock()
            .iter()
            .filter(|(_, op)| *op == "get")
            .map(|(l, _)| *l)
            .collect()
    }

    pub fn sets_started(&self) -> u64 {
        self.volatile.sets_started() + self.structured.sets_started() + self.blob.sets_started()
    }
}

/// Trained model that always recommends one layer
pub struct Prefers(pub LayerId);

impl TrainedModel for Prefers {
    fn predict_layer(&self, _f: &AccessFeatures, available: &[LayerId]) -> Option<LayerPrediction> {
        available.contains(&self.0).then(|| LayerPrediction {
            recommended_layer: self.0,
            confidence: 0.95,
            alternatives: vec![],
        })
    }
}

/// Poll until `check` holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
