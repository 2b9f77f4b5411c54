//! In-memory flow and instance stores.
//!
//! Useful for tests and single-process deployments; the engine behaves
//! identically with or without store hooks, only durability changes.

use dashmap::DashMap;
use flowline_core::services::{FlowStore, InstanceStore};
use flowline_types::{FlowRecord, InstanceRecord, StoreError};

/// Flow store over a concurrent map keyed by tag.
#[derive(Default)]
pub struct MemoryFlowStore {
    records: DashMap<String, FlowRecord>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FlowStore for MemoryFlowStore {
    fn load(&self, tag: &str) -> Result<Option<FlowRecord>, StoreError> {
        Ok(self.records.get(tag).map(|r| r.clone()))
    }

    fn save(&self, record: &FlowRecord) -> Result<(), StoreError> {
        self.records.insert(record.tag.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, tag: &str) -> Result<(), StoreError> {
        self.records.remove(tag);
        Ok(())
    }
}

/// Instance store over a concurrent map keyed by id.
#[derive(Default)]
pub struct MemoryInstanceStore {
    records: DashMap<String, InstanceRecord>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl InstanceStore for MemoryInstanceStore {
    fn load(&self, id: &str) -> Result<Option<InstanceRecord>, StoreError> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    fn save(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.remove(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::{Consistency, ContextMap, InstanceStatus};

    fn flow_record(tag: &str) -> FlowRecord {
        FlowRecord {
            tag: tag.into(),
            version: "1.0".into(),
            name: "Orders".into(),
            description: String::new(),
            total_attempts: 0,
            time_attempts: 0,
            retention_time: 900,
            steps: vec![],
            tp_consistency: Consistency::Eventual,
            team: String::new(),
            level: String::new(),
            created_by: "test".into(),
        }
    }

    fn instance_record(id: &str) -> InstanceRecord {
        InstanceRecord {
            created_at: chrono_now(),
            updated_at: chrono_now(),
            tag: "orders".into(),
            id: id.into(),
            created_by: "test".into(),
            updated_by: "test".into(),
            status: InstanceStatus::Pending,
            done_at: None,
            current: 0,
            ctx: ContextMap::new(),
            ctxs: Default::default(),
            pinned_data: ContextMap::new(),
            results: Default::default(),
            tags: ContextMap::new(),
            rollbacks: Default::default(),
            worker_host: "localhost".into(),
        }
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    #[test]
    fn flow_store_save_load_delete() {
        let store = MemoryFlowStore::new();
        assert!(store.load("orders").unwrap().is_none());

        store.save(&flow_record("orders")).unwrap();
        assert_eq!(store.load("orders").unwrap().unwrap().tag, "orders");
        assert_eq!(store.len(), 1);

        store.delete("orders").unwrap();
        assert!(store.load("orders").unwrap().is_none());
    }

    #[test]
    fn flow_store_save_overwrites() {
        let store = MemoryFlowStore::new();
        store.save(&flow_record("orders")).unwrap();
        let mut updated = flow_record("orders");
        updated.version = "2.0".into();
        store.save(&updated).unwrap();
        assert_eq!(store.load("orders").unwrap().unwrap().version, "2.0");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn instance_store_save_load_delete() {
        let store = MemoryInstanceStore::new();
        store.save(&instance_record("i-1")).unwrap();
        assert_eq!(store.load("i-1").unwrap().unwrap().id, "i-1");
        store.delete("i-1").unwrap();
        assert!(store.load("i-1").unwrap().is_none());
    }
}
