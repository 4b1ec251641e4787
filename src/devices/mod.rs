use futures_util::future::join_all;
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::ValueCache;
use crate::config::{ConfigError, DeviceConfig, PollConfig, TransportAddress};
use crate::connector::Connector;
#[cfg(any(feature = "iec62056", feature = "sml"))]
use crate::connector::{FrameKind, TcpConnector};
#[cfg(feature = "serial")]
use crate::connector::SerialConnector;
use crate::listeners::{ChannelListener, DeviceEvent, ListenerRegistry, LogListener};
use crate::models::DeviceProtocol;
use crate::parser::FrameParser;
use crate::scheduler::{PollState, Scheduler};

#[cfg(feature = "iec62056")]
use crate::metering_62056::Iec62056Parser;
#[cfg(feature = "modbus")]
use crate::metering_modbus::{ModbusTcpConnector, RegisterMap, RegisterParser};
#[cfg(feature = "sml")]
use crate::metering_sml::SmlParser;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device {0} is already running")]
    Duplicate(String),
    #[error("Device {0} is disabled")]
    Disabled(String),
    #[error("Device {device}: unknown protocol '{protocol}'")]
    UnknownProtocol { device: String, protocol: String },
    #[error("Device {device}: {protocol} is not available over {transport}")]
    Unsupported { device: String, protocol: String, transport: String },
    #[error("Device configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// What the rest of the process gets to see of a running device
pub struct DeviceHandle {
    name: String,
    protocol: DeviceProtocol,
    session_id: Uuid,
    state: watch::Receiver<PollState>,
    cache: Arc<ValueCache>,
    reset: Arc<Notify>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> DeviceProtocol {
        self.protocol
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.clone()
    }

    pub fn cache(&self) -> Arc<ValueCache> {
        self.cache.clone()
    }

    /// Wake a suspended device. Returns false if it was not suspended.
    pub fn reset(&self) -> bool {
        if self.state() != PollState::Suspended {
            return false;
        }
        info!("Resetting device {}", self.name);
        self.reset.notify_one();
        true
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the poll task to end
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Device task {} ended abnormally: {}", self.name, e);
            }
        }
    }
}

/// Builds and owns every device task of the process
pub struct DeviceManager {
    events: Sender<DeviceEvent>,
    devices: Vec<DeviceHandle>,
    cancel: CancellationToken,
}

impl DeviceManager {
    pub fn new(events: Sender<DeviceEvent>) -> Self {
        DeviceManager {
            events,
            devices: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn listeners_for(&self, name: &str) -> ListenerRegistry {
        let listeners = ListenerRegistry::new();
        listeners.register(Arc::new(ChannelListener::new(name, self.events.clone())));
        listeners.register(Arc::new(LogListener::new(name)));
        listeners
    }

    /// Start the poll task of a scheduler built elsewhere
    pub fn spawn<C, P>(&mut self, protocol: DeviceProtocol, scheduler: Scheduler<C, P>) -> Result<&DeviceHandle, DeviceError>
    where
        C: Connector + 'static,
        P: FrameParser + 'static,
    {
        if self.get(scheduler.name()).is_some() {
            return Err(DeviceError::Duplicate(scheduler.name().to_string()));
        }

        let cancel = self.cancel.child_token();
        let mut handle = DeviceHandle {
            name: scheduler.name().to_string(),
            protocol,
            session_id: scheduler.session_id(),
            state: scheduler.subscribe(),
            cache: scheduler.cache(),
            reset: scheduler.reset_handle(),
            cancel: cancel.clone(),
            task: None,
        };
        handle.task = Some(tokio::spawn(scheduler.run(cancel)));

        info!("Started device {} ({}) session {}", handle.name, protocol, handle.session_id);
        self.devices.push(handle);
        Ok(&self.devices[self.devices.len() - 1])
    }

    /// Build the connector/parser pair for `config` and start polling it
    pub fn add_device(&mut self, config: &DeviceConfig) -> Result<&DeviceHandle, DeviceError> {
        if !config.enabled {
            return Err(DeviceError::Disabled(config.name.clone()));
        }
        if self.get(&config.name).is_some() {
            return Err(DeviceError::Duplicate(config.name.clone()));
        }

        let protocol = DeviceProtocol::from_str(&config.protocol).ok_or_else(|| DeviceError::UnknownProtocol {
            device: config.name.clone(),
            protocol: config.protocol.clone(),
        })?;
        let poll = PollConfig::from_settings(&config.flat_settings()?)?;
        let listeners = self.listeners_for(&config.name);
        let name = config.name.as_str();

        match (protocol, &poll.transport) {
            #[cfg(feature = "iec62056")]
            (DeviceProtocol::Iec62056, TransportAddress::Tcp { host, port }) => {
                let connector = TcpConnector::new(host, *port, FrameKind::Telegram);
                self.spawn(protocol, Scheduler::new(name, connector, Iec62056Parser::new(), &poll, listeners))
            }
            #[cfg(all(feature = "iec62056", feature = "serial"))]
            (DeviceProtocol::Iec62056, TransportAddress::Serial { path }) => {
                let connector = SerialConnector::new(path, poll.baud_rate, FrameKind::Telegram);
                self.spawn(protocol, Scheduler::new(name, connector, Iec62056Parser::new(), &poll, listeners))
            }
            #[cfg(feature = "sml")]
            (DeviceProtocol::Sml, TransportAddress::Tcp { host, port }) => {
                let connector = TcpConnector::new(host, *port, FrameKind::Sml);
                self.spawn(protocol, Scheduler::new(name, connector, SmlParser::new(), &poll, listeners))
            }
            #[cfg(all(feature = "sml", feature = "serial"))]
            (DeviceProtocol::Sml, TransportAddress::Serial { path }) => {
                let connector = SerialConnector::new(path, poll.baud_rate, FrameKind::Sml);
                self.spawn(protocol, Scheduler::new(name, connector, SmlParser::new(), &poll, listeners))
            }
            #[cfg(feature = "modbus")]
            (DeviceProtocol::Modbus, TransportAddress::Modbus { host, port }) => {
                let map = Arc::new(RegisterMap::new(&config.registers)?);
                let connector = ModbusTcpConnector::new(host, *port, poll.unit_id, map.clone());
                self.spawn(protocol, Scheduler::new(name, connector, RegisterParser::new(map), &poll, listeners))
            }
            (protocol, transport) => Err(DeviceError::Unsupported {
                device: config.name.clone(),
                protocol: protocol.to_string(),
                transport: transport.to_string(),
            }),
        }
    }

    /// Start every configured device. Devices that fail to build are logged
    /// and skipped. Returns how many were started.
    pub fn start_all(&mut self, configs: &[DeviceConfig]) -> usize {
        let mut started = 0;
        for config in configs {
            match self.add_device(config) {
                Ok(_) => started += 1,
                Err(DeviceError::Disabled(name)) => info!("Device {} is disabled, skipping", name),
                Err(e) => warn!("Skipping device {}: {}", config.name, e),
            }
        }
        info!("{} of {} devices started", started, configs.len());
        started
    }

    pub fn get(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Stop one device and forget it
    pub async fn remove(&mut self, name: &str) -> bool {
        let Some(pos) = self.devices.iter().position(|d| d.name == name) else {
            return false;
        };
        let mut handle = self.devices.remove(pos);
        handle.cancel();
        handle.join().await;
        info!("Removed device {}", name);
        true
    }

    /// Cancel every device and wait until all of them closed their connection
    pub async fn shutdown(&mut self) {
        info!("Stopping {} devices", self.devices.len());
        self.cancel.cancel();
        join_all(self.devices.iter_mut().map(|d| d.join())).await;
        self.devices.clear();
        info!("All devices stopped");
    }
}
