use std::collections::HashMap;

use log::info;
use uuid::Uuid;

/// Service the identity payload is advertised under.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000abcd_0000_1000_8000_00805f9b34fb);

/// Service data an advertiser should emit for `device_id`.
pub fn encode_payload(device_id: &str) -> Vec<u8> {
    device_id.as_bytes().to_vec()
}

/// Identity carried under `service`, if present and valid UTF-8.
pub fn decode_payload(service_data: &HashMap<Uuid, Vec<u8>>, service: &Uuid) -> Option<String> {
    let bytes = service_data.get(service)?;
    let id = std::str::from_utf8(bytes).ok()?.trim_end_matches('\0');
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

#[cfg(target_os = "linux")]
fn advertisement(device_id: &str, service: Uuid) -> bluer::adv::Advertisement {
    bluer::adv::Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_data: [(service, encode_payload(device_id))].into(),
        discoverable: Some(true),
        ..Default::default()
    }
}

/// LE advertisement carrying this device's identity, registered with BlueZ.
pub struct Advertiser {
    device_id: String,
    #[cfg(target_os = "linux")]
    handle: Option<bluer::adv::AdvertisementHandle>,
    #[cfg(target_os = "linux")]
    _session: bluer::Session,
}

impl Advertiser {
    #[cfg(target_os = "linux")]
    pub async fn init(device_id: &str, service: Uuid) -> anyhow::Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        let handle = adapter.advertise(advertisement(device_id, service)).await?;
        info!("Advertising {} on {}", device_id, adapter.name());
        Ok(Advertiser {
            device_id: device_id.to_string(),
            handle: Some(handle),
            _session: session,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn init(device_id: &str, service: Uuid) -> anyhow::Result<Self> {
        anyhow::bail!("advertising {} under {} needs BlueZ", device_id, service)
    }

    #[cfg(target_os = "linux")]
    pub fn shutdown(&mut self) {
        if self.handle.take().is_some() {
            info!("Stopped advertising {}", self.device_id);
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn shutdown(&mut self) {}
}
