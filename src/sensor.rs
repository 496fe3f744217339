use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::messages::MotionSample;

pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 200;
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Linux IIO accelerometer read through sysfs,
/// e.g. `/sys/bus/iio/devices/iio:device0`.
pub struct IioAccelerometer {
    dir: PathBuf,
    scale: f32,
}

async fn read_value(path: &Path) -> anyhow::Result<f32> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    raw.trim()
        .parse()
        .with_context(|| format!("parsing {:?} from {}", raw.trim(), path.display()))
}

impl IioAccelerometer {
    pub async fn open(dir: &Path) -> anyhow::Result<Self> {
        let scale_path = dir.join("in_accel_scale");
        let scale = if tokio::fs::try_exists(&scale_path).await.unwrap_or(false) {
            read_value(&scale_path).await?
        } else {
            1.0
        };
        let accelerometer = IioAccelerometer {
            dir: dir.to_path_buf(),
            scale,
        };
        // Fail early rather than on the first tick.
        accelerometer.read().await?;
        Ok(accelerometer)
    }

    pub async fn read(&self) -> anyhow::Result<MotionSample> {
        let x = read_value(&self.dir.join("in_accel_x_raw")).await?;
        let y = read_value(&self.dir.join("in_accel_y_raw")).await?;
        let z = read_value(&self.dir.join("in_accel_z_raw")).await?;
        Ok(MotionSample {
            timestamp: Utc::now().timestamp_millis(),
            x: x * self.scale,
            y: y * self.scale,
            z: z * self.scale,
        })
    }
}

/// Push-based motion feed. Receivers that fall behind lose samples.
pub struct MotionFeed {
    sender: broadcast::Sender<MotionSample>,
    poller: Option<JoinHandle<()>>,
}

impl MotionFeed {
    /// Polls `device` at `interval`; without a device the feed stays silent.
    pub async fn start(device: Option<&Path>, interval: Duration, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let accelerometer = match device {
            Some(dir) => match IioAccelerometer::open(dir).await {
                Ok(accelerometer) => Some(accelerometer),
                Err(err) => {
                    warn!("Accelerometer unavailable, motion feed disabled: {:?}", err);
                    None
                }
            },
            None => {
                info!("No accelerometer configured, motion feed disabled");
                None
            }
        };

        let poller = accelerometer.map(|accelerometer| {
            let sender = sender.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    match accelerometer.read().await {
                        // Nobody listening is fine; samples are only kept while recording.
                        Ok(sample) => {
                            let _ = sender.send(sample);
                        }
                        Err(err) => debug!("Accelerometer read failed: {:?}", err),
                    }
                }
            })
        });

        MotionFeed { sender, poller }
    }

    pub fn sender(&self) -> broadcast::Sender<MotionSample> {
        self.sender.clone()
    }

    pub fn shutdown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}
