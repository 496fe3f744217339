use std::collections::BTreeMap;
#[cfg(test)]
use std::collections::HashMap;
use std::future::Future;

use tokio::sync::Mutex;

use crate::messages::{PresenceReport, TriggerPatch};
#[cfg(test)]
use crate::messages::TriggerRecord;

/// Keyed presence report storage. Writing the same key twice overwrites.
pub trait PresenceStore: Send + Sync {
    fn put_report(&self, report: &PresenceReport) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Writable side of the per-device trigger control record.
pub trait TriggerStore: Send + Sync {
    fn write_trigger(
        &self,
        device_id: &str,
        patch: &TriggerPatch,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Store kept in process memory, used to collect reports for summaries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    reports: Mutex<BTreeMap<String, PresenceReport>>,
    #[cfg(test)]
    triggers: Mutex<HashMap<String, TriggerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<PresenceReport> {
        self.reports.lock().await.values().cloned().collect()
    }

    #[cfg(test)]
    pub async fn report(&self, key: &str) -> Option<PresenceReport> {
        self.reports.lock().await.get(key).cloned()
    }

    #[cfg(test)]
    pub async fn trigger(&self, device_id: &str) -> TriggerRecord {
        self.triggers
            .lock()
            .await
            .get(device_id)
            .copied()
            .unwrap_or_default()
    }
}

impl PresenceStore for MemoryStore {
    async fn put_report(&self, report: &PresenceReport) -> anyhow::Result<()> {
        self.reports
            .lock()
            .await
            .insert(report.key(), report.clone());
        Ok(())
    }
}

#[cfg(test)]
impl TriggerStore for MemoryStore {
    async fn write_trigger(&self, device_id: &str, patch: &TriggerPatch) -> anyhow::Result<()> {
        self.triggers
            .lock()
            .await
            .entry(device_id.to_string())
            .or_default()
            .apply(patch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_slot_overwrites() {
        let store = MemoryStore::new();
        let first = PresenceReport::new("C-A", "10:05".to_string(), vec![]);
        let second = PresenceReport::new("C-A", "10:05".to_string(), vec!["C-B".to_string()]);
        store.put_report(&first).await.unwrap();
        store.put_report(&second).await.unwrap();

        let reports = store.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0], second);
    }

    #[tokio::test]
    async fn test_distinct_slots_kept() {
        let store = MemoryStore::new();
        store
            .put_report(&PresenceReport::new("C-A", "10:05".to_string(), vec![]))
            .await
            .unwrap();
        store
            .put_report(&PresenceReport::new("C-A", "10:10".to_string(), vec![]))
            .await
            .unwrap();
        store
            .put_report(&PresenceReport::new("C-B", "10:05".to_string(), vec![]))
            .await
            .unwrap();
        assert_eq!(store.reports().await.len(), 3);
        assert!(store.report("C-B_10:05").await.is_some());
    }

    #[tokio::test]
    async fn test_trigger_writes_merge() {
        let store = MemoryStore::new();
        store
            .write_trigger("C-A", &TriggerPatch::request_start())
            .await
            .unwrap();
        store
            .write_trigger("C-A", &TriggerPatch::request_stop())
            .await
            .unwrap();
        let record = store.trigger("C-A").await;
        assert!(record.motion_triggered);
        assert!(record.motion_stop);
        assert_eq!(store.trigger("C-B").await, TriggerRecord::default());
    }
}
