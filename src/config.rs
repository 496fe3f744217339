use std::path::PathBuf;
use std::time::Duration;

use serde_derive::Deserialize;
use uuid::Uuid;

use crate::advert;
use crate::aggregator::Whitelist;
use crate::distance::{DEFAULT_PATH_LOSS_EXPONENT, DEFAULT_REFERENCE_RSSI, PathLossModel};
use crate::filter::{DEFAULT_DEVIATION_THRESHOLD, DEFAULT_SUSPECT_LIMIT, FilterSettings};
use crate::reporter::{DEFAULT_INTERVAL_MINUTES, DEFAULT_NEARBY_DISTANCE, ReportSettings};
use crate::sensor::{DEFAULT_FEED_CAPACITY, DEFAULT_SAMPLE_INTERVAL_MS};
use crate::trigger::{DEFAULT_DISPLAY_SECONDS, RecordingSettings};

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub device: Option<DeviceConfig>,
    pub scan: Option<ScanConfig>,
    pub report: Option<ReportConfig>,
    pub recording: Option<RecordingConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl MqttConfig {
    /// Client id for one process; brokers drop an existing session on a duplicate id.
    pub fn client_id(&self, role: &str) -> String {
        let prefix = self.publisher_id.as_deref().unwrap_or("proximity-monitor");
        format!("{prefix}-{role}")
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    /// Identity advertised and reported, e.g. `C-A` or `EDU`
    pub id: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub reference_rssi: Option<i32>,
    pub path_loss_exponent: Option<f64>,
    pub deviation_threshold: Option<f64>,
    pub suspect_limit: Option<u32>,
    pub whitelist_prefixes: Option<Vec<String>>,
    pub whitelist_exact: Option<Vec<String>>,
    pub service_uuid: Option<Uuid>,
}

impl ScanConfig {
    pub fn path_loss_model(&self) -> PathLossModel {
        PathLossModel::new(
            self.reference_rssi.unwrap_or(DEFAULT_REFERENCE_RSSI),
            self.path_loss_exponent
                .filter(|n| n.is_finite() && *n > 0.0)
                .unwrap_or(DEFAULT_PATH_LOSS_EXPONENT),
        )
    }

    pub fn filter_settings(&self) -> FilterSettings {
        FilterSettings {
            deviation_threshold: self
                .deviation_threshold
                .filter(|t| t.is_finite() && *t > 0.0)
                .unwrap_or(DEFAULT_DEVIATION_THRESHOLD),
            suspect_limit: self
                .suspect_limit
                .filter(|l| *l > 0)
                .unwrap_or(DEFAULT_SUSPECT_LIMIT),
        }
    }

    pub fn whitelist(&self) -> Whitelist {
        let defaults = Whitelist::default();
        Whitelist {
            prefixes: self.whitelist_prefixes.clone().unwrap_or(defaults.prefixes),
            exact: self.whitelist_exact.clone().unwrap_or(defaults.exact),
        }
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid.unwrap_or(advert::SERVICE_UUID)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ReportConfig {
    pub interval_minutes: Option<u32>,
    pub nearby_distance: Option<f64>,
}

impl ReportConfig {
    pub fn settings(&self) -> ReportSettings {
        ReportSettings {
            interval_minutes: self
                .interval_minutes
                .filter(|m| *m > 0)
                .unwrap_or(DEFAULT_INTERVAL_MINUTES),
            nearby_distance: self.nearby_distance.unwrap_or(DEFAULT_NEARBY_DISTANCE),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct RecordingConfig {
    pub output_dir: Option<PathBuf>,
    pub display_seconds: Option<u64>,
    /// IIO accelerometer directory in sysfs
    pub sensor: Option<PathBuf>,
    pub sample_interval_ms: Option<u64>,
    pub feed_capacity: Option<usize>,
}

impl RecordingConfig {
    pub fn settings(&self) -> RecordingSettings {
        let defaults = RecordingSettings::default();
        RecordingSettings {
            output_dir: self.output_dir.clone().unwrap_or(defaults.output_dir),
            display_window: Duration::from_secs(
                self.display_seconds.unwrap_or(DEFAULT_DISPLAY_SECONDS),
            ),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(
            self.sample_interval_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
        )
    }

    pub fn feed_capacity(&self) -> usize {
        self.feed_capacity
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_FEED_CAPACITY)
    }
}
