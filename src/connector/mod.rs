use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::listeners::ListenerRegistry;
use crate::models::ConnectionState;

pub mod framing;
pub mod tcp;
#[cfg(feature = "serial")]
pub mod serial;

pub use framing::{FrameAssembler, FrameKind};
pub use tcp::TcpConnector;
#[cfg(feature = "serial")]
pub use serial::SerialConnector;

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Failed to connect to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connecting to {0} timed out")]
    Timeout(String),
    #[error("Invalid address {0}")]
    InvalidAddress(String),
}

impl ConnectError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ConnectError::InvalidAddress(_))
    }
}

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Read timed out")]
    Timeout,
    #[error("Connection reset: {0}")]
    Reset(String),
    #[error("Connection closed by peer")]
    Closed,
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl ReadError {
    pub fn is_transient(&self) -> bool {
        match self {
            ReadError::Timeout | ReadError::Reset(_) | ReadError::Closed => true,
            ReadError::Connect(e) => e.is_transient(),
            ReadError::Fatal(_) => false,
        }
    }
}

/// A transport that yields raw device frames
#[async_trait]
pub trait Connector: Send {
    type Session: Send;

    async fn open(&mut self) -> Result<Self::Session, ConnectError>;

    async fn read_frame(&mut self, session: &mut Self::Session, timeout: Duration) -> Result<Vec<u8>, ReadError>;

    async fn close(&mut self, session: Self::Session);

    /// Human readable address for log lines
    fn describe(&self) -> String;
}

/// Owns a connector, its session and the connection state.
///
/// Every transient failure drops the session. After `max_attempts`
/// consecutive failures the link turns `Failed` and reports
/// `ReadError::Fatal` until [`Link::reset`] is called.
pub struct Link<C: Connector> {
    connector: C,
    session: Option<C::Session>,
    state: ConnectionState,
    failures: u32,
    max_attempts: u32,
    listeners: ListenerRegistry,
}

impl<C: Connector> Link<C> {
    pub fn new(connector: C, max_attempts: u32, listeners: ListenerRegistry) -> Self {
        Link {
            connector,
            session: None,
            state: ConnectionState::Disconnected,
            failures: 0,
            max_attempts: max_attempts.max(1),
            listeners,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last good frame
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{}: {} -> {}", self.connector.describe(), self.state, state);
            self.state = state;
            self.listeners.notify_connection_state(state);
        }
    }

    pub async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, ReadError> {
        if self.state == ConnectionState::Failed {
            return Err(ReadError::Fatal(format!("{} has failed, reset required", self.connector.describe())));
        }

        match self.attempt(timeout).await {
            Ok(frame) => {
                self.failures = 0;
                Ok(frame)
            }
            Err(e) if e.is_transient() => {
                self.drop_session().await;
                self.failures += 1;
                if self.failures >= self.max_attempts {
                    self.set_state(ConnectionState::Failed);
                    Err(ReadError::Fatal(format!("giving up after {} attempts: {}", self.failures, e)))
                } else {
                    self.set_state(ConnectionState::Disconnected);
                    Err(e)
                }
            }
            Err(e) => {
                self.drop_session().await;
                self.set_state(ConnectionState::Failed);
                match e {
                    ReadError::Fatal(_) => Err(e),
                    other => Err(ReadError::Fatal(other.to_string())),
                }
            }
        }
    }

    /// Connecting and reading share one deadline of `timeout`
    async fn attempt(&mut self, timeout: Duration) -> Result<Vec<u8>, ReadError> {
        let deadline = Instant::now() + timeout;
        if self.session.is_none() {
            self.set_state(ConnectionState::Connecting);
            let session = match tokio::time::timeout_at(deadline, self.connector.open()).await {
                Ok(result) => result?,
                Err(_) => return Err(ConnectError::Timeout(self.connector.describe()).into()),
            };
            info!("Connected to {}", self.connector.describe());
            self.session = Some(session);
            self.set_state(ConnectionState::Connected);
        }

        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return Err(ReadError::Closed),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout_at(deadline, self.connector.read_frame(session, remaining)).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::Timeout),
        }
    }

    async fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("Dropping connection to {}", self.connector.describe());
            self.connector.close(session).await;
        }
    }

    /// Clear the failure budget so a failed link may reconnect
    pub fn reset(&mut self) {
        self.failures = 0;
        if self.state == ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Close the session if there is one. Calling it twice is harmless.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.connector.close(session).await;
            info!("Closed connection to {}", self.connector.describe());
        }
        if self.state != ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}
