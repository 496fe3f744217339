use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use rumqttc::{Event, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter};
use tokio::sync::broadcast;

use crate::config;
use crate::messages::{MqttAnnouncement, PresenceReport, TriggerPatch, TriggerRecord};
use crate::store::{PresenceStore, TriggerStore};

const REPORTS_COLLECTION: &str = "presence_reports";
const TRIGGERS_COLLECTION: &str = "triggers";
const PATCH_SUFFIX: &str = "set";

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topic_path: String,
}

/// What an incoming topic refers to, relative to the topic path.
#[derive(Debug, PartialEq, Eq)]
enum TopicKind<'a> {
    Report,
    TriggerRecord(&'a str),
    TriggerPatch(&'a str),
}

fn classify<'a>(topic_path: &str, topic: &'a str) -> Option<TopicKind<'a>> {
    let rest = topic.strip_prefix(topic_path)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(REPORTS_COLLECTION), Some(_), None, None) => Some(TopicKind::Report),
        (Some(TRIGGERS_COLLECTION), Some(id), None, None) => Some(TopicKind::TriggerRecord(id)),
        (Some(TRIGGERS_COLLECTION), Some(id), Some(PATCH_SUFFIX), None) => {
            Some(TopicKind::TriggerPatch(id))
        }
        _ => None,
    }
}

fn parse(topic_path: &str, topic: &str, payload: &[u8]) -> anyhow::Result<Option<MqttAnnouncement>> {
    let Some(kind) = classify(topic_path, topic) else {
        return Ok(None);
    };
    let message = match kind {
        TopicKind::Report => MqttAnnouncement::PresenceReport(serde_json::from_slice(payload)?),
        TopicKind::TriggerRecord(id) => MqttAnnouncement::TriggerRecord {
            device_id: id.to_string(),
            record: serde_json::from_slice(payload)?,
        },
        TopicKind::TriggerPatch(id) => MqttAnnouncement::TriggerPatch {
            device_id: id.to_string(),
            patch: serde_json::from_slice(payload)?,
        },
    };
    Ok(Some(message))
}

impl MqttClient {
    /// A persistent session keeps QoS 1 messages queued at the broker while offline;
    /// it needs a `client_id` that is stable across restarts.
    pub fn new(
        config: &config::MqttConfig,
        client_id: String,
        persistent_session: bool,
    ) -> (Self, rumqttc::EventLoop) {
        debug!("Connecting to MQTT as {}", client_id);
        let mut mqttoptions =
            MqttOptions::new(client_id, config.host.clone(), config.port.unwrap_or(1883));

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));
        mqttoptions.set_clean_session(!persistent_session);

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                topic_path: config.topic_path.clone().unwrap_or("proximity".to_string()),
            },
            eventloop,
        )
    }

    fn report_topic(&self, key: &str) -> String {
        format!("{}/{}/{}", self.topic_path, REPORTS_COLLECTION, key)
    }

    fn trigger_topic(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.topic_path, TRIGGERS_COLLECTION, device_id)
    }

    fn patch_topic(&self, device_id: &str) -> String {
        format!("{}/{}", self.trigger_topic(device_id), PATCH_SUFFIX)
    }

    /// Topics a device listens on: its trigger record and writes to it.
    pub fn device_topics(&self, device_id: &str) -> Vec<String> {
        vec![self.trigger_topic(device_id), self.patch_topic(device_id)]
    }

    pub fn report_topics(&self) -> Vec<String> {
        vec![self.report_topic("+")]
    }

    pub async fn subscribe(&self, topics: &[String]) -> Result<(), rumqttc::ClientError> {
        if topics.is_empty() {
            return Ok(());
        }
        self.client
            .subscribe_many(
                topics
                    .iter()
                    .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce)),
            )
            .await?;

        Ok(())
    }

    /// Drives the connection, forwarding recognised messages to `tx`.
    /// Subscribes to `topics` again after every reconnect, and returns once a
    /// DISCONNECT has been sent.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        topics: Vec<String>,
        tx: broadcast::Sender<MqttAnnouncement>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    Event::Incoming(Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        match parse(&self.topic_path, &p.topic, &p.payload) {
                            Ok(Some(message)) => {
                                if let Err(err) = tx.send(message) {
                                    error!("Error announcing MQTT message: {:?}", err);
                                }
                            }
                            Ok(None) => debug!("Ignoring message on topic {}", p.topic),
                            Err(err) => warn!("Malformed message on {}: {:?}", p.topic, err),
                        }
                    }
                    Event::Incoming(Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    Event::Outgoing(Outgoing::Disconnect) => {
                        debug!("MQTT connection closed");
                        return;
                    }
                    Event::Incoming(Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe(&topics).await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Publishes the merged trigger record so late subscribers see current state.
    pub async fn publish_trigger_record(
        &self,
        device_id: &str,
        record: &TriggerRecord,
    ) -> anyhow::Result<()> {
        self.client
            .publish(
                self.trigger_topic(device_id),
                QoS::AtLeastOnce,
                true,
                serde_json::to_vec(record)?,
            )
            .await
            .context("publishing trigger record")
    }

    /// Reads the retained trigger record for `device_id`; `None` if the broker
    /// has none within `wait`.
    pub async fn retained_trigger_record(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        device_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<TriggerRecord>> {
        let topic = self.trigger_topic(device_id);
        self.subscribe(std::slice::from_ref(&topic)).await?;
        let received = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == topic => {
                        return serde_json::from_slice::<TriggerRecord>(&p.payload)
                            .map(Some)
                            .context("decoding retained trigger record");
                    }
                    Ok(event) => debug!("Waiting for retained trigger record: {:?}", event),
                    Err(err) => return Err(anyhow::Error::from(err)),
                }
            }
        };
        match tokio::time::timeout(wait, received).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    /// Polls the event loop until the broker acknowledged `count` publishes.
    pub async fn flush(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        count: usize,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let acknowledged = async {
            let mut remaining = count;
            while remaining > 0 {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => remaining -= 1,
                    Ok(event) => debug!("Waiting for acknowledgement: {:?}", event),
                    Err(err) => return Err(anyhow::Error::from(err)),
                }
            }
            Ok(())
        };
        tokio::time::timeout(timeout, acknowledged)
            .await
            .context("timed out waiting for broker")?
    }

    async fn collect_reports_forever<S: PresenceStore>(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        store: &S,
    ) -> anyhow::Result<()> {
        let topics = self.report_topics();
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(_)) => self.subscribe(&topics).await?,
                Event::Incoming(Packet::Publish(p)) => {
                    if let Err(err) = store_report(&self.topic_path, &p.topic, &p.payload, store).await
                    {
                        warn!("Malformed message on {}: {:?}", p.topic, err);
                    }
                }
                _ => {}
            }
        }
    }

    /// Stores every presence report the broker delivers within `wait`.
    pub async fn collect_reports<S: PresenceStore>(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        store: &S,
        wait: Duration,
    ) -> anyhow::Result<()> {
        match tokio::time::timeout(wait, self.collect_reports_forever(eventloop, store)).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }

    /// Disconnects and polls `eventloop` until the DISCONNECT went out.
    pub async fn close(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        self.disconnect().await?;
        let sent = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(event) => debug!("Waiting for disconnect: {:?}", event),
                    Err(err) => return Err(anyhow::Error::from(err)),
                }
            }
        };
        tokio::time::timeout(timeout, sent)
            .await
            .context("timed out disconnecting")?
    }
}

/// Puts `payload` into `store` when `topic` carries a presence report.
async fn store_report<S: PresenceStore>(
    topic_path: &str,
    topic: &str,
    payload: &[u8],
    store: &S,
) -> anyhow::Result<()> {
    if let Some(MqttAnnouncement::PresenceReport(report)) = parse(topic_path, topic, payload)? {
        store.put_report(&report).await?;
    }
    Ok(())
}

impl PresenceStore for MqttClient {
    async fn put_report(&self, report: &PresenceReport) -> anyhow::Result<()> {
        info!(
            "Announcing presence of {} at {} (alone: {})",
            report.device_id, report.time, report.is_alone
        );
        // Retained per key, so a repeat for the same slot replaces the earlier one.
        self.client
            .publish(
                self.report_topic(&report.key()),
                QoS::AtLeastOnce,
                true,
                serde_json::to_vec(report)?,
            )
            .await
            .context("publishing presence report")
    }
}

impl TriggerStore for MqttClient {
    async fn write_trigger(&self, device_id: &str, patch: &TriggerPatch) -> anyhow::Result<()> {
        self.client
            .publish(
                self.patch_topic(device_id),
                QoS::AtLeastOnce,
                false,
                serde_json::to_vec(patch)?,
            )
            .await
            .context("publishing trigger patch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    const DISCONNECT: [u8; 2] = [0xe0, 0x00];

    /// Accepts one client, acknowledges its CONNECT and returns every byte
    /// received up to and including DISCONNECT.
    async fn broker() -> (config::MqttConfig, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 512];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                if received.is_empty() {
                    socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
                }
                received.extend_from_slice(&buf[..n]);
                if received.ends_with(&DISCONNECT) {
                    break;
                }
            }
            received
        });
        let config = config::MqttConfig {
            host: "127.0.0.1".to_string(),
            port: Some(port),
            username: None,
            password: None,
            publisher_id: None,
            topic_path: None,
            keep_alive_seconds: None,
        };
        (config, handle)
    }

    #[test]
    fn test_classify_topics() {
        assert_eq!(
            classify("proximity", "proximity/presence_reports/C-A_10:05"),
            Some(TopicKind::Report)
        );
        assert_eq!(
            classify("proximity", "proximity/triggers/C-A"),
            Some(TopicKind::TriggerRecord("C-A"))
        );
        assert_eq!(
            classify("proximity", "proximity/triggers/C-A/set"),
            Some(TopicKind::TriggerPatch("C-A"))
        );
        assert_eq!(classify("proximity", "proximity/triggers/C-A/get"), None);
        assert_eq!(classify("proximity", "other/triggers/C-A"), None);
        assert_eq!(classify("proximity", "proximityx/triggers/C-A"), None);
    }

    #[test]
    fn test_parse_patch() {
        let message = parse("proximity", "proximity/triggers/C-A/set", br#"{"motion_stop":true}"#)
            .unwrap()
            .unwrap();
        let MqttAnnouncement::TriggerPatch { device_id, patch } = message else {
            panic!("expected a trigger patch");
        };
        assert_eq!(device_id, "C-A");
        assert_eq!(patch, TriggerPatch::request_stop());
    }

    #[test]
    fn test_parse_report() {
        let payload = br#"{"deviceId":"C-A","time":"10:05","isAlone":true,"nearbyIds":[]}"#;
        let message = parse("proximity", "proximity/presence_reports/C-A_10:05", payload)
            .unwrap()
            .unwrap();
        let MqttAnnouncement::PresenceReport(report) = message else {
            panic!("expected a presence report");
        };
        assert!(report.is_alone);
        assert_eq!(report.key(), "C-A_10:05");
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse("proximity", "proximity/triggers/C-A", b"not json").is_err());
        assert!(parse("proximity", "elsewhere", b"not json").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_burst_fully_stored() {
        let store = MemoryStore::new();
        let mut count = 0;
        for device in ["C-A", "C-B", "C-C", "EDU"] {
            for slot in 0..288 {
                let time = format!("{:02}:{:02}", slot * 5 / 60, slot * 5 % 60);
                let report = PresenceReport::new(device, time, vec![]);
                let topic = format!("proximity/presence_reports/{}", report.key());
                let payload = serde_json::to_vec(&report).unwrap();
                store_report("proximity", &topic, &payload, &store).await.unwrap();
                count += 1;
            }
        }
        store_report("proximity", "proximity/triggers/C-A", b"{}", &store)
            .await
            .unwrap();
        assert_eq!(store.reports().await.len(), count);
    }

    #[tokio::test]
    async fn test_malformed_report_not_stored() {
        let store = MemoryStore::new();
        assert!(
            store_report("proximity", "proximity/presence_reports/C-A_10:05", b"{", &store)
                .await
                .is_err()
        );
        assert!(store.reports().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_sends_disconnect() {
        let (config, broker) = broker().await;
        let (client, mut eventloop) = MqttClient::new(&config, config.client_id("test"), false);

        client
            .close(&mut eventloop, Duration::from_secs(5))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        assert!(received.ends_with(&DISCONNECT));
    }

    #[tokio::test]
    async fn test_event_loop_ends_after_disconnect() {
        let (config, broker) = broker().await;
        let (client, mut eventloop) = MqttClient::new(&config, config.client_id("C-A"), true);
        let (tx, _rx) = broadcast::channel(4);

        let listener = client.clone();
        let handle = tokio::spawn(async move {
            listener.event_loop(&mut eventloop, Vec::new(), tx).await;
        });
        client.disconnect().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        let received = broker.await.unwrap();
        assert!(received.ends_with(&DISCONNECT));
    }
}
