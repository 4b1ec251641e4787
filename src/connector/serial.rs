use async_trait::async_trait;
use log::warn;
use std::time::Duration;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

use super::framing::{read_frame_from, FrameAssembler, FrameKind};
use super::{ConnectError, Connector, ReadError};

/// Reads delimited frames from a serial line (optical probe, P1 port)
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
    kind: FrameKind,
}

pub struct SerialSession {
    port: SerialStream,
    assembler: FrameAssembler,
}

impl SerialConnector {
    pub fn new(path: &str, baud_rate: u32, kind: FrameKind) -> Self {
        SerialConnector { path: path.to_string(), baud_rate, kind }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    type Session = SerialSession;

    async fn open(&mut self) -> Result<SerialSession, ConnectError> {
        let port = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => ConnectError::InvalidAddress(self.describe()),
                _ => ConnectError::Io {
                    address: self.describe(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                },
            })?;
        Ok(SerialSession { port, assembler: FrameAssembler::new(self.kind) })
    }

    async fn read_frame(&mut self, session: &mut SerialSession, timeout: Duration) -> Result<Vec<u8>, ReadError> {
        // Meters push on their own schedule, start from fresh data
        if let Err(e) = session.port.clear(ClearBuffer::Input) {
            warn!("Unable to clear input of {}: {}", self.path, e);
        }
        session.assembler.clear();

        let SerialSession { port, assembler } = session;
        match tokio::time::timeout(timeout, read_frame_from(port, assembler)).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Timeout),
        }
    }

    async fn close(&mut self, session: SerialSession) {
        drop(session);
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path, self.baud_rate)
    }
}
