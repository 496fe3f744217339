use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, Timelike};
use log::{debug, error, info};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregator::SharedAggregator;
use crate::messages::PresenceReport;
use crate::store::PresenceStore;

pub const DEFAULT_INTERVAL_MINUTES: u32 = 5;
pub const DEFAULT_NEARBY_DISTANCE: f64 = 2.0;

/// Source of wall-clock time for slot alignment and labels.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportSettings {
    pub interval_minutes: u32,
    pub nearby_distance: f64,
}

impl Default for ReportSettings {
    fn default() -> Self {
        ReportSettings {
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            nearby_distance: DEFAULT_NEARBY_DISTANCE,
        }
    }
}

/// Whole minutes until the next multiple of `interval`; 0 when already on one.
pub fn first_delay_minutes(minute: u32, interval: u32) -> u32 {
    minute.div_ceil(interval) * interval - minute
}

/// Delay until the first tick, aligned to the wall clock.
///
/// A start anywhere inside an aligned minute fires immediately.
pub fn first_delay(now: NaiveTime, interval: u32) -> Duration {
    let minutes = first_delay_minutes(now.minute(), interval);
    if minutes == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(u64::from(minutes) * 60 - u64::from(now.second()))
}

/// `HH:mm` of the slot boundary closest to `now`.
pub fn slot_label(now: NaiveTime, interval: u32) -> String {
    let slot_secs = i64::from(interval) * 60;
    let secs = i64::from(now.num_seconds_from_midnight());
    let rounded = ((secs + slot_secs / 2) / slot_secs * slot_secs) % 86_400;
    format!("{:02}:{:02}", rounded / 3600, (rounded % 3600) / 60)
}

pub async fn build_report(
    device_id: &str,
    aggregator: &SharedAggregator,
    settings: &ReportSettings,
    now: NaiveTime,
) -> PresenceReport {
    let nearby_ids = aggregator
        .read()
        .await
        .nearby_device_ids(settings.nearby_distance)
        .into_iter()
        .filter(|id| id != device_id)
        .collect();
    PresenceReport::new(device_id, slot_label(now, settings.interval_minutes), nearby_ids)
}

/// Clock-aligned periodic presence publisher for one device.
pub struct PresenceReporter {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PresenceReporter {
    pub fn start<S: PresenceStore + 'static, C: Clock>(
        device_id: String,
        settings: ReportSettings,
        aggregator: SharedAggregator,
        store: Arc<S>,
        clock: Arc<C>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let delay = first_delay(clock.now().time(), settings.interval_minutes);
        let period = Duration::from_secs(u64::from(settings.interval_minutes) * 60);
        info!(
            "Reporting presence for {} every {} minutes, first in {:?}",
            device_id, settings.interval_minutes, delay
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }
                let report =
                    build_report(&device_id, &aggregator, &settings, clock.now().time()).await;
                for device in aggregator.read().await.all_devices_sorted_by_distance() {
                    debug!("{}: ~{:.2} meters", device.device_id, device.estimated_distance);
                }
                debug!("Publishing presence report {:?}", report);
                if let Err(err) = store.put_report(&report).await {
                    error!("Error publishing presence report {}: {:?}", report.key(), err);
                }
            }
            debug!("Presence reporter for {} stopped", device_id);
        });

        PresenceReporter {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Stops future ticks and waits for an in-flight publish to finish.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!("Presence reporter task failed: {:?}", err);
            }
        }
    }
}
