use async_trait::async_trait;
use log::debug;
use rmodbus::{client::ModbusRequest, ModbusProto};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::RegisterKind;
use crate::connector::{ConnectError, Connector, ReadError};

pub mod registers;

pub use registers::{RegisterBlock, RegisterMap, RegisterParser};

/// Polls the planned register blocks of one Modbus TCP unit. Each frame it
/// returns is the register image that [`RegisterParser`] decodes.
pub struct ModbusTcpConnector {
    host: String,
    port: u16,
    unit_id: u8,
    map: Arc<RegisterMap>,
}

impl ModbusTcpConnector {
    pub fn new(host: &str, port: u16, unit_id: u8, map: Arc<RegisterMap>) -> Self {
        ModbusTcpConnector { host: host.to_string(), port, unit_id, map }
    }

    async fn read_block(&self, stream: &mut TcpStream, block: &RegisterBlock, image: &mut Vec<u8>) -> Result<(), ReadError> {
        let mut mreq = ModbusRequest::new(self.unit_id, ModbusProto::TcpUdp);
        let mut request = Vec::new();

        let generated = match block.kind {
            RegisterKind::Holding => mreq.generate_get_holdings(block.start, block.count, &mut request),
            RegisterKind::Input => mreq.generate_get_inputs(block.start, block.count, &mut request),
        };
        generated.map_err(|e| ReadError::Fatal(format!("cannot build request for {}+{}: {:?}", block.start, block.count, e)))?;

        stream.write_all(&request).await.map_err(io_error)?;

        // MBAP header: transaction, protocol, remaining length
        let mut header = [0u8; 6];
        stream.read_exact(&mut header).await.map_err(io_error)?;
        if header[2..4] != [0, 0] {
            return Err(ReadError::Reset(format!("not a Modbus TCP response: {:02x?}", header)));
        }
        let remaining = u16::from_be_bytes([header[4], header[5]]) as usize;

        let mut response = Vec::with_capacity(6 + remaining);
        response.extend_from_slice(&header);
        response.resize(6 + remaining, 0);
        stream.read_exact(&mut response[6..]).await.map_err(io_error)?;

        let mut data: Vec<u16> = Vec::new();
        mreq.parse_u16(&response, &mut data)
            .map_err(|e| ReadError::Reset(format!("Modbus error reading {}+{}: {:?}", block.start, block.count, e)))?;
        if data.len() < block.count as usize {
            return Err(ReadError::Reset(format!(
                "short Modbus response: {} of {} registers",
                data.len(),
                block.count
            )));
        }

        for word in &data[..block.count as usize] {
            image.extend_from_slice(&word.to_be_bytes());
        }
        Ok(())
    }

    async fn read_image(&self, stream: &mut TcpStream) -> Result<Vec<u8>, ReadError> {
        let mut image = Vec::with_capacity(self.map.image_words() * 2);
        for block in self.map.blocks() {
            debug!("{} reading {:?} registers {}+{}", self.describe(), block.kind, block.start, block.count);
            self.read_block(stream, block, &mut image).await?;
        }
        Ok(image)
    }
}

fn io_error(e: std::io::Error) -> ReadError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ReadError::Closed,
        _ => ReadError::Reset(e.to_string()),
    }
}

#[async_trait]
impl Connector for ModbusTcpConnector {
    type Session = TcpStream;

    async fn open(&mut self) -> Result<TcpStream, ConnectError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ConnectError::Io { address: self.describe(), source: e })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn read_frame(&mut self, session: &mut TcpStream, timeout: Duration) -> Result<Vec<u8>, ReadError> {
        match tokio::time::timeout(timeout, self.read_image(session)).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Timeout),
        }
    }

    async fn close(&mut self, session: TcpStream) {
        drop(session);
    }

    fn describe(&self) -> String {
        format!("modbus://{}:{}/{}", self.host, self.port, self.unit_id)
    }
}
