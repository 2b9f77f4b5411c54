//! Concrete collaborators for the flowline engine.
//!
//! Everything here implements a trait from `flowline_core::services`:
//! in-memory flow/instance stores and cache, broadcast and recording
//! event buses, a blocking HTTP client for the script `fetch` binding, a
//! thread-based resilience scheduler, and an in-memory data source.
//! Embedders swap any of these for their own implementations.

pub mod bus;
pub mod cache;
pub mod data;
pub mod http;
pub mod memory;
pub mod scheduler;

pub use bus::{BroadcastBus, BusEvent, RecordingBus};
pub use cache::MemoryCache;
pub use data::MemoryDataSource;
pub use http::BlockingHttpClient;
pub use memory::{MemoryFlowStore, MemoryInstanceStore};
pub use scheduler::ThreadScheduler;
