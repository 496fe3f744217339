use serde_derive::{Deserialize, Serialize};

/// One presence snapshot for a device in a given reporting slot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceReport {
    pub device_id: String,
    pub time: String,
    pub is_alone: bool,
    pub nearby_ids: Vec<String>,
}

impl PresenceReport {
    pub fn new(device_id: &str, time: String, nearby_ids: Vec<String>) -> Self {
        PresenceReport {
            device_id: device_id.to_string(),
            time,
            is_alone: nearby_ids.is_empty(),
            nearby_ids,
        }
    }

    /// Store key; one record per device and slot.
    pub fn key(&self) -> String {
        format!("{}_{}", self.device_id, self.time)
    }
}

/// Remote control document for a device's motion recording.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct TriggerRecord {
    pub motion_triggered: bool,
    pub motion_stop: bool,
    pub recording: bool,
    pub stopped: bool,
    pub upload_complete: bool,
}

/// Partial write to a [`TriggerRecord`]. Absent fields are left untouched.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct TriggerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_triggered: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_stop: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_complete: Option<bool>,
}

impl TriggerPatch {
    /// What a controller writes to ask a device to start recording.
    pub fn request_start() -> Self {
        TriggerPatch {
            motion_triggered: Some(true),
            motion_stop: Some(false),
            recording: Some(false),
            stopped: Some(false),
            upload_complete: Some(false),
        }
    }

    pub fn request_stop() -> Self {
        TriggerPatch {
            motion_stop: Some(true),
            ..Default::default()
        }
    }
}

impl TriggerRecord {
    /// Last write wins, field by field.
    pub fn apply(&mut self, patch: &TriggerPatch) {
        if let Some(v) = patch.motion_triggered {
            self.motion_triggered = v;
        }
        if let Some(v) = patch.motion_stop {
            self.motion_stop = v;
        }
        if let Some(v) = patch.recording {
            self.recording = v;
        }
        if let Some(v) = patch.stopped {
            self.stopped = v;
        }
        if let Some(v) = patch.upload_complete {
            self.upload_complete = v;
        }
    }
}

/// A single accelerometer reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    /// Unix time in milliseconds
    pub timestamp: i64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl MotionSample {
    pub fn to_csv_row(&self) -> String {
        format!("{},{},{},{}\n", self.timestamp, self.x, self.y, self.z)
    }
}

/// Messages surfaced from the MQTT event loop.
#[derive(Clone, Debug)]
pub enum MqttAnnouncement {
    TriggerPatch {
        device_id: String,
        patch: TriggerPatch,
    },
    TriggerRecord {
        device_id: String,
        record: TriggerRecord,
    },
    PresenceReport(PresenceReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_wire_format() {
        let report = PresenceReport::new("C-A", "10:05".to_string(), vec!["C-B".to_string()]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["deviceId"], "C-A");
        assert_eq!(json["time"], "10:05");
        assert_eq!(json["isAlone"], false);
        assert_eq!(json["nearbyIds"][0], "C-B");
        assert_eq!(report.key(), "C-A_10:05");
    }

    #[test]
    fn test_report_alone_when_nobody_nearby() {
        let report = PresenceReport::new("C-A", "10:05".to_string(), vec![]);
        assert!(report.is_alone);
    }

    #[test]
    fn test_patch_merges_field_by_field() {
        let mut record: TriggerRecord =
            serde_json::from_str(r#"{"motion_triggered": true, "recording": true}"#).unwrap();
        record.apply(&TriggerPatch::request_stop());
        assert!(record.motion_triggered);
        assert!(record.motion_stop);
        assert!(record.recording);

        record.apply(&TriggerPatch::request_start());
        assert_eq!(
            record,
            TriggerRecord {
                motion_triggered: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_stop_patch_only_carries_stop() {
        let json = serde_json::to_string(&TriggerPatch::request_stop()).unwrap();
        assert_eq!(json, r#"{"motion_stop":true}"#);
    }

    #[test]
    fn test_sample_row() {
        let sample = MotionSample {
            timestamp: 1_700_000_000_123,
            x: 0.5,
            y: -1.0,
            z: 9.75,
        };
        assert_eq!(sample.to_csv_row(), "1700000000123,0.5,-1,9.75\n");
    }
}
