use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::{broadcast, watch};

use crate::messages::{MotionSample, TriggerPatch, TriggerRecord};
use crate::recorder::MotionRecorder;
use crate::reporter::Clock;
use crate::store::TriggerStore;

pub const DEFAULT_DISPLAY_SECONDS: u64 = 6;

/// Path of a finished session, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    pub session: u64,
    pub path: Option<PathBuf>,
}

/// What the UI shows about recording.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStatus {
    pub recording: bool,
    pub last_artifact: Option<SavedArtifact>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Started,
    Stopped(Option<PathBuf>),
}

enum SessionState {
    Idle,
    Recording(MotionRecorder),
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub output_dir: PathBuf,
    pub display_window: Duration,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        RecordingSettings {
            output_dir: PathBuf::from("motion_data"),
            display_window: Duration::from_secs(DEFAULT_DISPLAY_SECONDS),
        }
    }
}

/// Starts and stops the motion recorder from the remote trigger record.
///
/// Every notification is the full current record; handling one twice is harmless.
pub struct TriggerCoordinator<S, C> {
    device_id: String,
    store: Arc<S>,
    clock: Arc<C>,
    settings: RecordingSettings,
    feed: broadcast::Sender<MotionSample>,
    state: SessionState,
    sessions: u64,
    status: Arc<watch::Sender<RecorderStatus>>,
}

impl<S: TriggerStore + 'static, C: Clock> TriggerCoordinator<S, C> {
    pub fn new(
        device_id: String,
        store: Arc<S>,
        clock: Arc<C>,
        settings: RecordingSettings,
        feed: broadcast::Sender<MotionSample>,
    ) -> Self {
        let (status, _) = watch::channel(RecorderStatus::default());
        TriggerCoordinator {
            device_id,
            store,
            clock,
            settings,
            feed,
            state: SessionState::Idle,
            sessions: 0,
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> watch::Receiver<RecorderStatus> {
        self.status.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        matches!(&self.state, SessionState::Recording(recorder) if recorder.is_active())
    }

    pub async fn on_record(&mut self, record: &TriggerRecord) -> Option<Transition> {
        match (self.is_recording(), record.motion_triggered, record.motion_stop) {
            (false, true, _) => Some(self.start_session().await),
            (true, _, true) => Some(self.stop_session().await),
            _ => {
                debug!("Trigger record for {} needs no action: {:?}", self.device_id, record);
                None
            }
        }
    }

    async fn start_session(&mut self) -> Transition {
        info!("Motion triggered for {}", self.device_id);
        let recorder = MotionRecorder::start(
            &self.settings.output_dir,
            &self.device_id,
            self.clock.now(),
            self.feed.subscribe(),
        )
        .await;
        self.state = SessionState::Recording(recorder);
        self.sessions += 1;
        self.status.send_modify(|status| status.recording = true);

        self.write(TriggerPatch {
            motion_triggered: Some(false),
            recording: Some(true),
            ..Default::default()
        })
        .await;
        Transition::Started
    }

    async fn stop_session(&mut self) -> Transition {
        let SessionState::Recording(mut recorder) =
            std::mem::replace(&mut self.state, SessionState::Idle)
        else {
            return Transition::Stopped(None);
        };
        info!("Motion stop requested for {}", self.device_id);
        let path = recorder.stop().await;

        self.write(TriggerPatch {
            motion_stop: Some(false),
            recording: Some(false),
            stopped: Some(true),
            upload_complete: Some(true),
            ..Default::default()
        })
        .await;
        self.show_artifact(path.clone());
        Transition::Stopped(path)
    }

    fn show_artifact(&self, path: Option<PathBuf>) {
        let session = self.sessions;
        self.status.send_modify(|status| {
            status.recording = false;
            status.last_artifact = Some(SavedArtifact { session, path });
        });

        let status = self.status.clone();
        let window = self.settings.display_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            status.send_if_modified(|status| match &status.last_artifact {
                Some(artifact) if artifact.session == session => {
                    status.last_artifact = None;
                    true
                }
                _ => false,
            });
        });
    }

    async fn write(&self, patch: TriggerPatch) {
        if let Err(err) = self.store.write_trigger(&self.device_id, &patch).await {
            error!("Error writing trigger record for {}: {:?}", self.device_id, err);
        }
    }

    /// Closes an open session and marks the remote record as no longer recording.
    pub async fn shutdown(&mut self) {
        if let SessionState::Recording(mut recorder) =
            std::mem::replace(&mut self.state, SessionState::Idle)
        {
            let path = recorder.stop().await;
            info!("Recording for {} closed on shutdown: {:?}", self.device_id, path);
            self.status.send_modify(|status| status.recording = false);
            self.write(TriggerPatch {
                recording: Some(false),
                stopped: Some(true),
                ..Default::default()
            })
            .await;
        }
    }
}

/// Local copy of this device's trigger record, rebuilt from partial writes.
#[derive(Debug, Default)]
pub struct TriggerMirror {
    record: TriggerRecord,
    seeded: bool,
}

impl TriggerMirror {
    #[cfg(test)]
    pub fn record(&self) -> &TriggerRecord {
        &self.record
    }

    pub fn apply(&mut self, patch: &TriggerPatch) -> &TriggerRecord {
        self.record.apply(patch);
        self.seeded = true;
        &self.record
    }

    /// Takes a full record published before we started; ignored once live.
    pub fn seed(&mut self, record: TriggerRecord) -> Option<&TriggerRecord> {
        if self.seeded {
            return None;
        }
        self.record = record;
        self.seeded = true;
        Some(&self.record)
    }
}
