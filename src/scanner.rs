use std::collections::HashMap;
use std::hash::Hash;

use btleplug::api::{Central as _, CentralEvent, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt as _;
use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::aggregator::{ScanEvent, SharedAggregator};
use crate::filter::Decision;

/// Turns peripheral properties into a scan event, if they carry a signal strength.
fn scan_event(properties: PeripheralProperties) -> Option<ScanEvent> {
    Some(ScanEvent {
        rssi: properties.rssi?,
        service_data: properties.service_data,
    })
}

/// Last reading taken from each peripheral.
///
/// One advertisement can arrive as several events that all read the same
/// cached properties; only the first of them is a new reading.
#[derive(Debug)]
struct RecentReadings<K> {
    last: HashMap<K, ScanEvent>,
}

impl<K> Default for RecentReadings<K> {
    fn default() -> Self {
        RecentReadings {
            last: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> RecentReadings<K> {
    fn is_repeat(&mut self, key: K, event: &ScanEvent) -> bool {
        if self.last.get(&key) == Some(event) {
            return true;
        }
        self.last.insert(key, event.clone());
        false
    }
}

pub struct Scanner {
    adapter: Adapter,
    aggregator: SharedAggregator,
    recent: RecentReadings<PeripheralId>,
}

impl Scanner {
    pub fn new(adapter: Adapter, aggregator: SharedAggregator) -> Self {
        Scanner {
            adapter,
            aggregator,
            recent: RecentReadings::default(),
        }
    }

    async fn properties(&self, id: &PeripheralId) -> anyhow::Result<Option<PeripheralProperties>> {
        let peripheral = self.adapter.peripheral(id).await?;
        Ok(peripheral.properties().await?)
    }

    async fn handle(&mut self, id: &PeripheralId) {
        let properties = match self.properties(id).await {
            Ok(Some(properties)) => properties,
            Ok(None) => return,
            Err(err) => {
                debug!("Could not read properties of {:?}: {:?}", id, err);
                return;
            }
        };
        let Some(event) = scan_event(properties) else {
            return;
        };
        if self.recent.is_repeat(id.clone(), &event) {
            return;
        }
        let decision = self.aggregator.write().await.ingest(&event);
        if let Some(Decision::Confirmed) = decision {
            debug!("Confirmed a proximity change for {:?}", id);
        }
    }

    /// Scans until `shutdown` fires or the adapter's event stream ends.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Started BLE scanning");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.next() => {
                    match event {
                        Some(CentralEvent::DeviceDiscovered(id))
                        | Some(CentralEvent::DeviceUpdated(id))
                        | Some(CentralEvent::ServiceDataAdvertisement { id, .. }) => {
                            self.handle(&id).await;
                        }
                        Some(_) => {}
                        None => {
                            warn!("No more BLE events");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(err) = self.adapter.stop_scan().await {
            warn!("Error stopping BLE scan: {:?}", err);
        }
        info!("Stopped BLE scanning");
        Ok(())
    }
}
