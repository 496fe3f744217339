use std::sync::Arc;
use std::time::Duration;

use btleplug::platform::Adapter;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, oneshot};

use crate::advert::Advertiser;
use crate::aggregator::ScanAggregator;
use crate::config::AppConfig;
use crate::messages::{MqttAnnouncement, TriggerRecord};
use crate::mqtt::MqttClient;
use crate::reporter::{PresenceReporter, SystemClock};
use crate::scanner::Scanner;
use crate::sensor::MotionFeed;
use crate::trigger::{RecorderStatus, TriggerCoordinator, TriggerMirror};

pub struct Manager {
    config: AppConfig,
    device_id: String,
    adapter: Adapter,
    mqtt_client: MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
}

/// Current trigger record after `message`, and whether it came from a partial write.
fn current_record(
    device_id: &str,
    mirror: &mut TriggerMirror,
    message: MqttAnnouncement,
) -> Option<(TriggerRecord, bool)> {
    match message {
        MqttAnnouncement::TriggerPatch { device_id: id, patch } if id == device_id => {
            Some((*mirror.apply(&patch), true))
        }
        MqttAnnouncement::TriggerRecord { device_id: id, record } if id == device_id => {
            mirror.seed(record).map(|record| (*record, false))
        }
        _ => None,
    }
}

fn show_status(status: &RecorderStatus) {
    if status.recording {
        info!("Motion triggered");
    } else if let Some(artifact) = &status.last_artifact {
        match &artifact.path {
            Some(path) => info!("Saved locally: {}", path.display()),
            None => warn!("Recording finished without a saved file"),
        }
    } else {
        debug!("Recording status cleared");
    }
}

impl Manager {
    pub fn new(
        config: AppConfig,
        device_id: String,
        adapter: Adapter,
        mqtt_client: MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
    ) -> Self {
        Manager {
            config,
            device_id,
            adapter,
            mqtt_client,
            mqtt_event_loop,
        }
    }

    pub async fn run_loop(self) -> anyhow::Result<()> {
        let Manager {
            config,
            device_id,
            adapter,
            mqtt_client,
            mut mqtt_event_loop,
        } = self;
        let scan = config.scan.clone().unwrap_or_default();
        let recording = config.recording.clone().unwrap_or_default();
        let aggregator = ScanAggregator::new(
            scan.service_uuid(),
            scan.whitelist(),
            scan.path_loss_model(),
            scan.filter_settings(),
        )
        .shared();
        let store = Arc::new(mqtt_client.clone());
        let clock = Arc::new(SystemClock);

        // Trigger record updates for this device
        let (tx, mut rx) = broadcast::channel(64);
        let topics = mqtt_client.device_topics(&device_id);
        mqtt_client.subscribe(&topics).await?;
        let listener = mqtt_client.clone();
        let mut mqtt_handle = tokio::spawn(async move {
            listener.event_loop(&mut mqtt_event_loop, topics, tx).await;
        });

        let mut advertiser = match Advertiser::init(&device_id, scan.service_uuid()).await {
            Ok(advertiser) => Some(advertiser),
            Err(err) => {
                warn!("Not advertising {}, peers won't see us: {:?}", device_id, err);
                None
            }
        };

        let (scan_shutdown, scan_shutdown_rx) = oneshot::channel();
        let mut scanner = Scanner::new(adapter, aggregator.clone());
        let mut scan_handle = tokio::spawn(async move { scanner.run(scan_shutdown_rx).await });
        let mut scan_finished = false;

        let mut feed = MotionFeed::start(
            recording.sensor.as_deref(),
            recording.sample_interval(),
            recording.feed_capacity(),
        )
        .await;
        let mut reporter = PresenceReporter::start(
            device_id.clone(),
            config.report.clone().unwrap_or_default().settings(),
            aggregator.clone(),
            store.clone(),
            clock.clone(),
        );
        let mut coordinator = TriggerCoordinator::new(
            device_id.clone(),
            store.clone(),
            clock,
            recording.settings(),
            feed.sender(),
        );
        let mut status = coordinator.status();
        let mut mirror = TriggerMirror::default();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Interrupted, shutting down");
                    break;
                }
                result = &mut scan_handle => {
                    scan_finished = true;
                    match result {
                        Ok(Err(err)) => error!("Error handling BTLE events: {:?}", err),
                        Err(err) => error!("BTLE task failed: {:?}", err),
                        Ok(Ok(())) => {}
                    }
                    break;
                }
                changed = status.changed() => {
                    if changed.is_ok() {
                        show_status(&status.borrow_and_update());
                    }
                }
                message = rx.recv() => match message {
                    Ok(message) => {
                        let Some((record, merged)) = current_record(&device_id, &mut mirror, message) else {
                            continue;
                        };
                        if merged {
                            if let Err(err) = store.publish_trigger_record(&device_id, &record).await {
                                error!("Error publishing trigger record: {:?}", err);
                            }
                        }
                        coordinator.on_record(&record).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} trigger updates", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("MQTT listener closed");
                        break;
                    }
                }
            }
        }

        reporter.shutdown().await;
        coordinator.shutdown().await;
        feed.shutdown();
        if let Some(advertiser) = advertiser.as_mut() {
            advertiser.shutdown();
        }
        if !scan_finished {
            let _ = scan_shutdown.send(());
            match scan_handle.await {
                Ok(Err(err)) => error!("Error handling BTLE events: {:?}", err),
                Err(err) => error!("BTLE task failed: {:?}", err),
                Ok(Ok(())) => {}
            }
        }
        info!("Exiting manager event loop");

        mqtt_client.disconnect().await?;
        if tokio::time::timeout(Duration::from_secs(5), &mut mqtt_handle)
            .await
            .is_err()
        {
            warn!("MQTT connection did not close in time");
            mqtt_handle.abort();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TriggerPatch;

    #[test]
    fn test_patches_for_other_devices_ignored() {
        let mut mirror = TriggerMirror::default();
        let message = MqttAnnouncement::TriggerPatch {
            device_id: "C-B".to_string(),
            patch: TriggerPatch::request_start(),
        };
        assert_eq!(current_record("C-A", &mut mirror, message), None);
        assert_eq!(*mirror.record(), TriggerRecord::default());
    }

    #[test]
    fn test_patch_merges_into_mirror() {
        let mut mirror = TriggerMirror::default();
        let message = MqttAnnouncement::TriggerPatch {
            device_id: "C-A".to_string(),
            patch: TriggerPatch::request_start(),
        };
        let (record, merged) = current_record("C-A", &mut mirror, message).unwrap();
        assert!(merged);
        assert!(record.motion_triggered);
    }

    #[test]
    fn test_retained_record_seeds_once() {
        let mut mirror = TriggerMirror::default();
        let retained = TriggerRecord {
            motion_triggered: true,
            ..Default::default()
        };
        let seed = MqttAnnouncement::TriggerRecord {
            device_id: "C-A".to_string(),
            record: retained,
        };
        assert_eq!(
            current_record("C-A", &mut mirror, seed.clone()),
            Some((retained, false))
        );
        // Our own republished record echoes back and must not be re-applied.
        assert_eq!(current_record("C-A", &mut mirror, seed), None);
    }
}
