use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, trace};
use serde_derive::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::advert;
use crate::distance::PathLossModel;
use crate::filter::{Decision, FilterSettings, ProximityFilter};

pub type SharedAggregator = Arc<RwLock<ScanAggregator>>;

/// Identities we track; everything else seen over the air is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Whitelist {
    pub prefixes: Vec<String>,
    pub exact: Vec<String>,
}

impl Default for Whitelist {
    fn default() -> Self {
        Whitelist {
            prefixes: vec!["C-".to_string()],
            exact: vec!["EDU".to_string()],
        }
    }
}

impl Whitelist {
    pub fn matches(&self, device_id: &str) -> bool {
        self.exact.iter().any(|e| e == device_id)
            || self.prefixes.iter().any(|p| device_id.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedDevice {
    pub device_id: String,
    pub estimated_distance: f64,
}

/// A single advertisement as handed over by the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEvent {
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub rssi: i16,
}

/// Live set of detected devices, in discovery order.
#[derive(Debug)]
pub struct ScanAggregator {
    service_uuid: Uuid,
    whitelist: Whitelist,
    model: PathLossModel,
    filter: ProximityFilter,
    devices: Vec<DetectedDevice>,
}

impl Default for ScanAggregator {
    fn default() -> Self {
        ScanAggregator::new(
            advert::SERVICE_UUID,
            Whitelist::default(),
            PathLossModel::default(),
            FilterSettings::default(),
        )
    }
}

impl ScanAggregator {
    pub fn new(
        service_uuid: Uuid,
        whitelist: Whitelist,
        model: PathLossModel,
        settings: FilterSettings,
    ) -> Self {
        ScanAggregator {
            service_uuid,
            whitelist,
            model,
            filter: ProximityFilter::new(settings),
            devices: Vec::new(),
        }
    }

    pub fn shared(self) -> SharedAggregator {
        Arc::new(RwLock::new(self))
    }

    /// Feed one advertisement through the whitelist and the filter.
    ///
    /// Returns `None` when the advertisement is not one of ours.
    pub fn ingest(&mut self, event: &ScanEvent) -> Option<Decision> {
        let Some(device_id) = advert::decode_payload(&event.service_data, &self.service_uuid)
        else {
            trace!("Dropping advertisement without identity payload");
            return None;
        };
        if !self.whitelist.matches(&device_id) {
            trace!("Dropping advertisement from untracked identity {}", device_id);
            return None;
        }

        let distance = self.model.estimate(i32::from(event.rssi));
        let decision = self.filter.observe(&device_id, distance);
        if decision.is_accepted() {
            self.upsert(&device_id, distance);
        }
        Some(decision)
    }

    fn upsert(&mut self, device_id: &str, distance: f64) {
        match self.devices.iter_mut().find(|d| d.device_id == device_id) {
            Some(device) => device.estimated_distance = distance,
            None => self.devices.push(DetectedDevice {
                device_id: device_id.to_string(),
                estimated_distance: distance,
            }),
        }
        debug!("Detected {} at ~{:.2} meters", device_id, distance);
    }

    pub fn nearby_device_ids(&self, max_distance: f64) -> BTreeSet<String> {
        self.devices
            .iter()
            .filter(|d| d.estimated_distance <= max_distance)
            .map(|d| d.device_id.clone())
            .collect()
    }

    pub fn all_devices_sorted_by_distance(&self) -> Vec<DetectedDevice> {
        let mut devices = self.devices.clone();
        devices.sort_by(|a, b| a.estimated_distance.total_cmp(&b.estimated_distance));
        devices
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Advertisement carrying `id` at a given signal strength.
    pub(crate) fn advertisement(id: &str, rssi: i16) -> ScanEvent {
        ScanEvent {
            service_data: HashMap::from([(advert::SERVICE_UUID, advert::encode_payload(id))]),
            rssi,
        }
    }

    #[test]
    fn test_whitelist() {
        let whitelist = Whitelist::default();
        assert!(whitelist.matches("C-A"));
        assert!(whitelist.matches("EDU"));
        assert!(!whitelist.matches("X-1"));
        assert!(!whitelist.matches("EDU2"));
        assert!(!whitelist.matches("c-a"));
    }

    #[test]
    fn test_untracked_identity_dropped() {
        let mut aggregator = ScanAggregator::default();
        assert_eq!(aggregator.ingest(&advertisement("X-1", -59)), None);
        assert_eq!(
            aggregator.ingest(&advertisement("C-A", -59)),
            Some(Decision::First)
        );
        assert_eq!(
            aggregator.ingest(&advertisement("EDU", -59)),
            Some(Decision::First)
        );
        assert_eq!(aggregator.len(), 2);
    }

    #[test]
    fn test_missing_payload_dropped() {
        let mut aggregator = ScanAggregator::default();
        let event = ScanEvent {
            service_data: HashMap::new(),
            rssi: -40,
        };
        assert_eq!(aggregator.ingest(&event), None);
        assert_eq!(aggregator.len(), 0);
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let mut aggregator = ScanAggregator::default();
        aggregator.ingest(&advertisement("C-A", -59));
        aggregator.ingest(&advertisement("C-B", -79));
        aggregator.ingest(&advertisement("C-A", -61));

        let devices = aggregator.all_devices_sorted_by_distance();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "C-A");
        assert!((devices[0].estimated_distance - 10f64.powf(0.1)).abs() < 1e-9);
        assert_eq!(devices[1].device_id, "C-B");
    }

    #[test]
    fn test_rejected_reading_keeps_last_distance() {
        let mut aggregator = ScanAggregator::default();
        aggregator.ingest(&advertisement("C-A", -59));
        let decision = aggregator.ingest(&advertisement("C-A", -90));
        assert_eq!(decision, Some(Decision::Rejected { suspect_count: 1 }));
        assert_eq!(aggregator.all_devices_sorted_by_distance()[0].estimated_distance, 1.0);
    }

    #[test]
    fn test_nearby_device_ids() {
        let mut aggregator = ScanAggregator::default();
        aggregator.ingest(&advertisement("C-B", -60));
        aggregator.ingest(&advertisement("C-A", -62));
        aggregator.ingest(&advertisement("EDU", -85));

        let nearby: Vec<_> = aggregator.nearby_device_ids(2.0).into_iter().collect();
        assert_eq!(nearby, vec!["C-A".to_string(), "C-B".to_string()]);
        assert!(aggregator.nearby_device_ids(0.5).is_empty());
    }

    #[test]
    fn test_sorted_by_distance() {
        let mut aggregator = ScanAggregator::default();
        aggregator.ingest(&advertisement("C-C", -80));
        aggregator.ingest(&advertisement("C-A", -50));
        aggregator.ingest(&advertisement("EDU", -65));
        let ids: Vec<_> = aggregator
            .all_devices_sorted_by_distance()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(ids, vec!["C-A", "EDU", "C-C"]);
    }
}
