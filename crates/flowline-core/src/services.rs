//! Collaborator interfaces and the capability struct handed to the
//! registry.
//!
//! The engine consumes persistence, pub/sub, caching, HTTP, the query
//! layer and the resilience scheduler through these traits; concrete
//! implementations live in `flowline-infra` (or in the embedding
//! application). Storage hooks are optional: when absent, persistence is
//! in-memory only and engine semantics are unchanged. The remaining
//! collaborators default to no-op/unconfigured stand-ins whose failures
//! surface to scripts as thrown errors.

use std::sync::Arc;
use std::time::Duration;

use flowline_types::{ContextMap, FlowRecord, HostError, InstanceRecord, StoreError};
use serde_json::Value;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Storage hooks
// ---------------------------------------------------------------------------

/// Persistence hooks for flow templates, keyed by tag.
pub trait FlowStore: Send + Sync {
    fn load(&self, tag: &str) -> Result<Option<FlowRecord>, StoreError>;
    fn save(&self, record: &FlowRecord) -> Result<(), StoreError>;
    fn delete(&self, tag: &str) -> Result<(), StoreError>;
}

/// Persistence hooks for instances, keyed by id.
pub trait InstanceStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError>;
    fn save(&self, record: &InstanceRecord) -> Result<(), StoreError>;
    fn delete(&self, id: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Pub/sub
// ---------------------------------------------------------------------------

/// Outbound pub/sub bus.
///
/// `publish` is fan-out; `work` is the queue-style variant whose exact
/// semantics belong to the collaborator. Both are fire-and-forget from
/// the engine's point of view.
pub trait EventBus: Send + Sync {
    fn publish(&self, channel: &str, payload: Value);

    fn work(&self, channel: &str, payload: Value) {
        self.publish(channel, payload);
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// External key/value cache exposed to scripts.
pub trait Cache: Send + Sync {
    /// Store `value` under `key` with the given time-to-live, returning
    /// the stored value.
    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<Value, HostError>;

    /// Fetch `key`, returning `default` when absent or expired.
    fn get(&self, key: &str, default: Value) -> Result<Value, HostError>;

    /// Remove `key`, reporting whether it existed.
    fn delete(&self, key: &str) -> Result<bool, HostError>;

    /// Increment the integer at `key`, setting the time-to-live.
    fn incr(&self, key: &str, ttl: Duration) -> Result<i64, HostError>;

    /// Decrement the integer at `key`.
    fn decr(&self, key: &str) -> Result<i64, HostError>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Outbound HTTP client backing the script `fetch` binding.
///
/// Implementations must map non-success statuses to
/// [`HostError::Status`] so that scripts observe them as thrown errors.
pub trait HttpClient: Send + Sync {
    fn fetch(
        &self,
        method: &str,
        url: &str,
        headers: &ContextMap,
        body: &ContextMap,
    ) -> Result<Value, HostError>;
}

// ---------------------------------------------------------------------------
// Query layer
// ---------------------------------------------------------------------------

/// Data source backing the script `model`, `select` and `query` bindings.
pub trait DataSource: Send + Sync {
    /// Look up a data model handle.
    fn model(&self, database: &str, name: &str) -> Result<Value, HostError>;

    /// Execute a structured query and return the rows.
    fn select(&self, query: &ContextMap) -> Result<Value, HostError>;

    /// Execute a parameterized raw query.
    fn query(&self, database: &str, sql: &str, params: &[Value]) -> Result<Value, HostError>;
}

// ---------------------------------------------------------------------------
// Resilience scheduler
// ---------------------------------------------------------------------------

/// Handle to a registration with the resilience scheduler.
pub trait ResilienceHandle: Send + Sync {
    /// Current attempt count, 1-based. 0 before the first re-drive.
    fn attempt(&self) -> u32;

    /// True once the configured attempts are exhausted; the instance is
    /// then terminally failed.
    fn is_end(&self) -> bool;
}

/// Parameters of a resilience registration.
#[derive(Debug, Clone)]
pub struct RetrySpec {
    pub id: String,
    pub tag: String,
    pub description: String,
    pub total_attempts: u32,
    pub time_attempts: Duration,
    pub retention_time: Duration,
    pub tags: ContextMap,
    pub team: String,
    pub level: String,
}

/// The callable the scheduler invokes to re-drive a failed instance.
pub type DriverFn = Arc<dyn Fn(ContextMap) -> Result<ContextMap, EngineError> + Send + Sync>;

/// External scheduler that re-drives failed instances on a timer, up to
/// `total_attempts` times spaced by `time_attempts`, retaining state for
/// `retention_time`.
pub trait ResilienceScheduler: Send + Sync {
    fn add_custom(
        &self,
        spec: RetrySpec,
        driver: DriverFn,
        seed_ctx: ContextMap,
    ) -> Arc<dyn ResilienceHandle>;

    fn health_check(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Capability struct
// ---------------------------------------------------------------------------

/// The collaborators an engine instance is wired with.
///
/// Built once at startup and passed into [`crate::registry::WorkFlows`].
#[derive(Clone)]
pub struct Services {
    pub flow_store: Option<Arc<dyn FlowStore>>,
    pub instance_store: Option<Arc<dyn InstanceStore>>,
    pub bus: Arc<dyn EventBus>,
    pub cache: Arc<dyn Cache>,
    pub http: Arc<dyn HttpClient>,
    pub data: Arc<dyn DataSource>,
    pub resilience: Option<Arc<dyn ResilienceScheduler>>,
}

impl Services {
    pub fn builder() -> ServicesBuilder {
        ServicesBuilder::default()
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`Services`]; every collaborator is optional.
#[derive(Default)]
pub struct ServicesBuilder {
    flow_store: Option<Arc<dyn FlowStore>>,
    instance_store: Option<Arc<dyn InstanceStore>>,
    bus: Option<Arc<dyn EventBus>>,
    cache: Option<Arc<dyn Cache>>,
    http: Option<Arc<dyn HttpClient>>,
    data: Option<Arc<dyn DataSource>>,
    resilience: Option<Arc<dyn ResilienceScheduler>>,
}

impl ServicesBuilder {
    pub fn flow_store(mut self, store: Arc<dyn FlowStore>) -> Self {
        self.flow_store = Some(store);
        self
    }

    pub fn instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.instance_store = Some(store);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn data(mut self, data: Arc<dyn DataSource>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn resilience(mut self, scheduler: Arc<dyn ResilienceScheduler>) -> Self {
        self.resilience = Some(scheduler);
        self
    }

    pub fn build(self) -> Services {
        Services {
            flow_store: self.flow_store,
            instance_store: self.instance_store,
            bus: self.bus.unwrap_or_else(|| Arc::new(NoopBus)),
            cache: self.cache.unwrap_or_else(|| Arc::new(Unconfigured)),
            http: self.http.unwrap_or_else(|| Arc::new(Unconfigured)),
            data: self.data.unwrap_or_else(|| Arc::new(Unconfigured)),
            resilience: self.resilience,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Bus that drops every event.
struct NoopBus;

impl EventBus for NoopBus {
    fn publish(&self, _channel: &str, _payload: Value) {}
}

/// Stand-in for collaborators that were never wired; every call fails
/// with [`HostError::Unconfigured`].
struct Unconfigured;

impl Cache for Unconfigured {
    fn set(&self, _: &str, _: Value, _: Duration) -> Result<Value, HostError> {
        Err(HostError::Unconfigured("cache"))
    }

    fn get(&self, _: &str, _: Value) -> Result<Value, HostError> {
        Err(HostError::Unconfigured("cache"))
    }

    fn delete(&self, _: &str) -> Result<bool, HostError> {
        Err(HostError::Unconfigured("cache"))
    }

    fn incr(&self, _: &str, _: Duration) -> Result<i64, HostError> {
        Err(HostError::Unconfigured("cache"))
    }

    fn decr(&self, _: &str) -> Result<i64, HostError> {
        Err(HostError::Unconfigured("cache"))
    }
}

impl HttpClient for Unconfigured {
    fn fetch(
        &self,
        _: &str,
        _: &str,
        _: &ContextMap,
        _: &ContextMap,
    ) -> Result<Value, HostError> {
        Err(HostError::Unconfigured("http client"))
    }
}

impl DataSource for Unconfigured {
    fn model(&self, _: &str, _: &str) -> Result<Value, HostError> {
        Err(HostError::Unconfigured("data source"))
    }

    fn select(&self, _: &ContextMap) -> Result<Value, HostError> {
        Err(HostError::Unconfigured("data source"))
    }

    fn query(&self, _: &str, _: &str, _: &[Value]) -> Result<Value, HostError> {
        Err(HostError::Unconfigured("data source"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
