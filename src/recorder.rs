use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use log::{debug, error, info, warn};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt as _, BufWriter};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::messages::MotionSample;

/// `{device}_{yyyy-MM-dd_HH-mm-ss}.csv`
pub fn sink_name(device_id: &str, started: NaiveDateTime, attempt: u32) -> String {
    let stamp = started.format("%Y-%m-%d_%H-%M-%S");
    if attempt == 0 {
        format!("{device_id}_{stamp}.csv")
    } else {
        format!("{device_id}_{stamp}_{attempt}.csv")
    }
}

async fn open_sink(
    output_dir: &Path,
    device_id: &str,
    started: NaiveDateTime,
) -> std::io::Result<(PathBuf, File)> {
    tokio::fs::create_dir_all(output_dir).await?;
    let mut attempt = 0;
    loop {
        let path = output_dir.join(sink_name(device_id, started, attempt));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && attempt < 100 => attempt += 1,
            Err(err) => return Err(err),
        }
    }
}

/// One recording session: owns one CSV sink for one device.
pub struct MotionRecorder {
    device_id: String,
    path: Option<PathBuf>,
    active: bool,
    shutdown: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    saved: Option<PathBuf>,
}

impl MotionRecorder {
    /// Opens the sink and starts appending samples from `feed`.
    ///
    /// If the sink can't be created the session still runs, it just keeps nothing.
    pub async fn start(
        output_dir: &Path,
        device_id: &str,
        started: NaiveDateTime,
        feed: broadcast::Receiver<MotionSample>,
    ) -> Self {
        let (path, sink) = match open_sink(output_dir, device_id, started).await {
            Ok((path, file)) => {
                info!("Recording motion for {} to {}", device_id, path.display());
                (Some(path), Some(BufWriter::new(file)))
            }
            Err(err) => {
                error!(
                    "Failed to create motion sink in {}: {:?}",
                    output_dir.display(),
                    err
                );
                (None, None)
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let writer = tokio::spawn(write_samples(feed, sink, shutdown_rx));

        MotionRecorder {
            device_id: device_id.to_string(),
            path,
            active: true,
            shutdown: Some(shutdown_tx),
            writer: Some(writer),
            saved: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stops accepting samples, writes what was already delivered, closes the
    /// sink and returns its path.
    ///
    /// Calling it again returns the same result without side effects.
    pub async fn stop(&mut self) -> Option<PathBuf> {
        self.active = false;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(writer) = self.writer.take() else {
            return self.saved.clone();
        };
        if let Err(err) = writer.await {
            error!("Motion writer for {} failed: {:?}", self.device_id, err);
        }

        self.saved = match &self.path {
            Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => {
                info!("Motion data saved locally: {}", path.display());
                Some(path.clone())
            }
            _ => {
                warn!("Motion data for {} was not saved", self.device_id);
                None
            }
        };
        self.saved.clone()
    }
}

async fn append(sink: &mut Option<BufWriter<File>>, sample: &MotionSample) {
    if let Some(writer) = sink.as_mut() {
        if let Err(err) = writer.write_all(sample.to_csv_row().as_bytes()).await {
            warn!("Write failed: {:?}", err);
        }
    }
}

async fn write_samples(
    mut feed: broadcast::Receiver<MotionSample>,
    mut sink: Option<BufWriter<File>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                // Samples delivered before the stop still belong to the session.
                loop {
                    match feed.try_recv() {
                        Ok(sample) => append(&mut sink, &sample).await,
                        Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                            debug!("Motion feed skipped {} samples", missed);
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
            received = feed.recv() => match received {
                Ok(sample) => append(&mut sink, &sample).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Motion feed skipped {} samples", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Motion feed closed");
                    break;
                }
            }
        }
    }

    if let Some(mut writer) = sink {
        if let Err(err) = writer.flush().await {
            error!("Failed to flush motion sink: {:?}", err);
        }
        if let Err(err) = writer.into_inner().sync_all().await {
            error!("Failed to sync motion sink: {:?}", err);
        }
    }
}
