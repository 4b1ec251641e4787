use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use crate::models::{ChangedEntry, ConnectionState, Identifier, Value};
use crate::obis_utils::ObisCode;

/// Consumer of device updates, e.g. a channel updater
pub trait ValueListener: Send + Sync {
    fn on_value_changed(&self, identifier: &Identifier, value: &Value);
    fn on_connection_state_changed(&self, state: ConnectionState);
}

/// Fan-out of device events to every registered listener.
///
/// Cloning the registry shares the listener list.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<Vec<Arc<dyn ValueListener>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ValueListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Callbacks run without the lock held so a listener may register others
    fn current(&self) -> Vec<Arc<dyn ValueListener>> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn notify_value_changed(&self, entry: &ChangedEntry) {
        for listener in self.current() {
            listener.on_value_changed(&entry.identifier, &entry.value);
        }
    }

    pub fn notify_connection_state(&self, state: ConnectionState) {
        for listener in self.current() {
            listener.on_connection_state_changed(state);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    ValueChanged {
        device: String,
        identifier: Identifier,
        value: Value,
        time: DateTime<Utc>,
    },
    ConnectionStateChanged {
        device: String,
        state: ConnectionState,
        time: DateTime<Utc>,
    },
}

impl DeviceEvent {
    pub fn device(&self) -> &str {
        match self {
            DeviceEvent::ValueChanged { device, .. } => device,
            DeviceEvent::ConnectionStateChanged { device, .. } => device,
        }
    }
}

/// Forwards events, tagged with the device name, into a channel
pub struct ChannelListener {
    device: String,
    sender: Sender<DeviceEvent>,
}

impl ChannelListener {
    pub fn new(device: &str, sender: Sender<DeviceEvent>) -> Self {
        ChannelListener { device: device.to_string(), sender }
    }

    // Callbacks are synchronous, a full queue drops the event instead of waiting
    fn forward(&self, event: DeviceEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event queue is full, dropping event of {}", self.device);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Event receiver for {} is gone, dropping event", self.device);
            }
        }
    }
}

impl ValueListener for ChannelListener {
    fn on_value_changed(&self, identifier: &Identifier, value: &Value) {
        self.forward(DeviceEvent::ValueChanged {
            device: self.device.clone(),
            identifier: identifier.clone(),
            value: value.clone(),
            time: Utc::now(),
        });
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        self.forward(DeviceEvent::ConnectionStateChanged {
            device: self.device.clone(),
            state,
            time: Utc::now(),
        });
    }
}

pub struct LogListener {
    device: String,
}

impl LogListener {
    pub fn new(device: &str) -> Self {
        LogListener { device: device.to_string() }
    }
}

impl ValueListener for LogListener {
    fn on_value_changed(&self, identifier: &Identifier, value: &Value) {
        let description = identifier
            .as_str()
            .parse::<ObisCode>()
            .ok()
            .and_then(|code| code.description());

        match description {
            Some(d) => info!("{}: {} ({}) = {}", self.device, identifier, d, value),
            None => info!("{}: {} = {}", self.device, identifier, value),
        }
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Failed => warn!("{}: connection failed, polling suspended", self.device),
            _ => info!("{}: connection {}", self.device, state),
        }
    }
}
