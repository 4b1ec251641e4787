use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::net::TcpStream;

use super::framing::{read_frame_from, FrameAssembler, FrameKind};
use super::{ConnectError, Connector, ReadError};

/// Reads delimited frames from a raw TCP port, e.g. a meter behind ser2net
pub struct TcpConnector {
    host: String,
    port: u16,
    kind: FrameKind,
}

pub struct TcpSession {
    stream: TcpStream,
    assembler: FrameAssembler,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16, kind: FrameKind) -> Self {
        TcpConnector { host: host.to_string(), port, kind }
    }
}

/// Throw away whatever the device pushed since the last poll
fn drain_stale(session: &mut TcpSession) -> Result<(), ReadError> {
    let mut scratch = [0u8; 1024];
    let mut dropped = 0usize;
    loop {
        match session.stream.try_read(&mut scratch) {
            Ok(0) => return Err(ReadError::Closed),
            Ok(n) => dropped += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(ReadError::Reset(e.to_string())),
        }
    }
    if dropped > 0 {
        debug!("Dropped {} stale bytes", dropped);
    }
    session.assembler.clear();
    Ok(())
}

#[async_trait]
impl Connector for TcpConnector {
    type Session = TcpSession;

    async fn open(&mut self) -> Result<TcpSession, ConnectError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ConnectError::Io { address: self.describe(), source: e })?;
        let _ = stream.set_nodelay(true);
        Ok(TcpSession { stream, assembler: FrameAssembler::new(self.kind) })
    }

    async fn read_frame(&mut self, session: &mut TcpSession, timeout: Duration) -> Result<Vec<u8>, ReadError> {
        drain_stale(session)?;
        let TcpSession { stream, assembler } = session;
        match tokio::time::timeout(timeout, read_frame_from(stream, assembler)).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Timeout),
        }
    }

    async fn close(&mut self, session: TcpSession) {
        drop(session);
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reads_telegram_from_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // give the client time to drain before the telegram shows up
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.write_all(b"/ELS5\r\n\r\n1-0:1.8.0(1.5*kWh)\r\n!\r\n").await.unwrap();
            socket
        });

        let mut connector = TcpConnector::new("127.0.0.1", port, FrameKind::Telegram);
        let mut session = connector.open().await.unwrap();
        let frame = connector.read_frame(&mut session, Duration::from_secs(5)).await.unwrap();
        assert!(frame.starts_with(b"/ELS5"));
        connector.close(session).await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut connector = TcpConnector::new("127.0.0.1", port, FrameKind::Sml);
        let err = connector.open().await.err().unwrap();
        assert!(err.is_transient());
    }
}
