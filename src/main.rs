use metersync::{Config, DeviceEvent, DeviceManager};
use std::time::Duration;
use log::{error, info};
use tokio::sync::mpsc::{channel, Receiver};
use tokio::task::JoinHandle;


// Events queued for the consumer, further ones are dropped
const EVENT_QUEUE_SIZE: usize = 1000;

/// Without a broker every change is already logged by the devices, just
/// keep the queue empty
async fn drain_events(mut rx: Receiver<DeviceEvent>) {
    while rx.recv().await.is_some() {}
}

fn start_consumer(config: &Config, rx: Receiver<DeviceEvent>) -> JoinHandle<()> {
    #[cfg(feature = "mqtt")]
    if let Some(mqtt) = &config.mqtt {
        info!("Publishing to MQTT broker {}:{} below {}", mqtt.host, mqtt.port, mqtt.base_topic);
        let publisher = metersync::MqttPublisher::new(mqtt, rx);
        return tokio::spawn(publisher.start_thread());
    }

    #[cfg(not(feature = "mqtt"))]
    if config.mqtt.is_some() {
        error!("MQTT is configured but this build has no MQTT support");
    }

    tokio::spawn(drain_events(rx))
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("METERSYNC_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::locate().and_then(|path| Config::load(&path)) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    // devices report into this channel, the consumer forwards everything
    let (tx, rx) = channel(EVENT_QUEUE_SIZE);
    let consumer = start_consumer(&config, rx);

    let mut devices = DeviceManager::new(tx);
    let started = devices.start_all(&config.devices);
    if started == 0 {
        error!("No device could be started, check the configuration");
    }

    info!("All {} devices started, now waiting for a signal to exit", started);
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    devices.shutdown().await;
    // the manager owns the last sender, dropping it ends the consumer
    drop(devices);
    if tokio::time::timeout(Duration::from_secs(5), consumer).await.is_err() {
        error!("Event consumer did not finish in time");
    }
    Ok(())
}
