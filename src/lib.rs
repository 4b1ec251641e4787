//! Device state synchronization for meters and field devices
//!
//! Devices are polled over TCP, serial lines or Modbus TCP. Every frame is
//! parsed into readings, merged into a per device value cache, and each
//! change is forwarded to the registered listeners.

pub mod models;
pub mod config;
pub mod obis_utils;
pub mod parser;
pub mod connector;
pub mod cache;
pub mod listeners;
pub mod scheduler;
pub mod devices;

#[cfg(feature = "iec62056")]
pub mod metering_62056;
#[cfg(feature = "sml")]
pub mod metering_sml;
#[cfg(feature = "modbus")]
pub mod metering_modbus;
#[cfg(feature = "mqtt")]
pub mod mqtt;

// Re-export common types for easier access
pub use models::{ConnectionState, DeviceProtocol, Identifier, Reading, ReadingSet, Value};
pub use config::{Config, ConfigError, DeviceConfig};
pub use parser::{FrameParser, ParseError};
pub use connector::{Connector, Link};
pub use cache::ValueCache;
pub use listeners::{DeviceEvent, ListenerRegistry, ValueListener};
pub use scheduler::{PollOutcome, PollState, Scheduler};
pub use devices::{DeviceError, DeviceHandle, DeviceManager};
#[cfg(feature = "iec62056")]
pub use metering_62056::Iec62056Parser;
#[cfg(feature = "sml")]
pub use metering_sml::SmlParser;
#[cfg(feature = "modbus")]
pub use metering_modbus::{ModbusTcpConnector, RegisterMap, RegisterParser};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttPublisher;
