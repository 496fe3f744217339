use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use uuid::Uuid;

mod advert;
mod aggregator;
mod config;
mod distance;
mod filter;
mod manager;
mod messages;
mod mqtt;
mod recorder;
mod reporter;
mod scanner;
mod sensor;
mod store;
mod summary;
mod trigger;

use messages::TriggerPatch;
use store::{MemoryStore, TriggerStore as _};

const BROKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Client id for a short-lived command, unique per invocation.
fn command_client_id(config: &config::AppConfig, command: &str) -> String {
    config
        .mqtt
        .client_id(&format!("{command}-{}", Uuid::new_v4().simple()))
}

#[derive(Parser, Debug)]
#[command(version, about = "BLE proximity monitor with presence reporting")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan, report presence and react to recording triggers (default)
    Run,
    /// Ask a device to start or stop recording motion
    Trigger {
        device_id: String,
        #[arg(value_enum)]
        action: TriggerAction,
    },
    /// Print the presence timeline from published reports
    Summary {
        #[arg(long, default_value_t = 5)]
        wait_seconds: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TriggerAction {
    Start,
    Stop,
}

async fn run(config: config::AppConfig) -> anyhow::Result<()> {
    let device_id = config
        .device
        .as_ref()
        .map(|d| d.id.clone())
        .ok_or_else(|| anyhow!("[device] id is required to run"))?;
    info!("Running as {}", device_id);

    let client_id = config.mqtt.client_id(&device_id);
    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt, client_id, true);

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;

    let core = manager::Manager::new(config, device_id, central, mqtt_client, eventloop);
    core.run_loop().await
}

async fn trigger(
    config: config::AppConfig,
    device_id: String,
    action: TriggerAction,
) -> anyhow::Result<()> {
    let client_id = command_client_id(&config, "trigger");
    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(&config.mqtt, client_id, false);
    let patch = match action {
        TriggerAction::Start => TriggerPatch::request_start(),
        TriggerAction::Stop => TriggerPatch::request_stop(),
    };

    // The retained record carries the request to a device that is offline now.
    let mut record = mqtt_client
        .retained_trigger_record(&mut eventloop, &device_id, Duration::from_secs(2))
        .await?
        .unwrap_or_default();
    record.apply(&patch);
    mqtt_client.publish_trigger_record(&device_id, &record).await?;
    mqtt_client.write_trigger(&device_id, &patch).await?;
    mqtt_client.flush(&mut eventloop, 2, BROKER_TIMEOUT).await?;
    info!("Sent {:?} to {}", action, device_id);

    mqtt_client.close(&mut eventloop, BROKER_TIMEOUT).await
}

async fn summary(config: config::AppConfig, wait: Duration) -> anyhow::Result<()> {
    let client_id = command_client_id(&config, "summary");
    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(&config.mqtt, client_id, false);

    let store = MemoryStore::new();
    mqtt_client
        .collect_reports(&mut eventloop, &store, wait)
        .await?;
    mqtt_client.close(&mut eventloop, BROKER_TIMEOUT).await?;

    print!("{}", summary::render(&store.reports().await));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let cli = Cli::parse();
    let config_contents = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Trigger { device_id, action } => trigger(config, device_id, action).await,
        Command::Summary { wait_seconds } => {
            summary(config, Duration::from_secs(wait_seconds)).await
        }
    }
}
