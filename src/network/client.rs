//! Network Client
//!
//! TCP client for talking to a node manager: used by the standby forwarder
//! and the command line tools.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{read_message, write_message};
use crate::error::{Error, Result};
use crate::protocol::{Request, Response};

/// Client holding one persistent connection to a manager
pub struct NetworkClient {
    /// Manager address
    address: String,
    /// Open connection, reestablished on demand
    stream: Mutex<Option<TcpStream>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(address: String, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            address,
            stream: Mutex::new(None),
            connect_timeout,
            request_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request and wait for its response
    pub async fn request(&self, request: Request) -> Result<Response> {
        let result = timeout(self.request_timeout, self.request_inner(&request)).await;

        match result {
            Ok(inner_result) => inner_result,
            // The in-flight stream is dropped with the cancelled future
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    /// Send without timeout wrapper
    async fn request_inner(&self, request: &Request) -> Result<Response> {
        let mut slot = self.stream.lock().await;

        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let (mut reader, mut writer) = stream.split();
        write_message(&mut writer, request).await?;
        let response: Response = read_message(&mut reader).await?;

        // Keep the connection only after a complete exchange
        *slot = Some(stream);
        tracing::trace!(
            "{} answered {} with {}",
            self.address,
            request.type_name(),
            response.type_name()
        );
        Ok(response)
    }

    /// Connect to the manager
    async fn connect(&self) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                tracing::debug!("Connected to {}", self.address);
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    /// Drop the connection, if any
    pub async fn close(&self) {
        self.stream.lock().await.take();
    }

    /// Whether a connection is currently open
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }
}
