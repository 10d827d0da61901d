//! In-process transport.
//!
//! Endpoints are registered by name on an [`InprocHub`]; connecting hands
//! the listener one end of an in-memory duplex pipe, so in-process peers use
//! exactly the same framing as TCP peers.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::{
    io::DuplexStream,
    sync::mpsc,
};

use crate::error::{NetworkError, NetworkResult};

const PIPE_CAPACITY: usize = 256 * 1024;

type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<DuplexStream>>>>;

/// Registry of named in-process endpoints.
#[derive(Debug, Clone, Default)]
pub struct InprocHub {
    endpoints: Registry,
}

impl InprocHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register endpoint `name`.
    pub fn bind(&self, name: &str) -> NetworkResult<InprocListener> {
        let mut endpoints = self
            .endpoints
            .lock()
            .map_err(|_| NetworkError::ConnectionFailed(name.to_string(), "hub poisoned".into()))?;
        if endpoints.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(NetworkError::ConnectionFailed(
                name.to_string(),
                "endpoint already bound".into(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        endpoints.insert(name.to_string(), tx);
        Ok(InprocListener {
            name: name.to_string(),
            rx,
            endpoints: self.endpoints.clone(),
        })
    }

    /// Open a pipe to endpoint `name`.
    pub fn connect(&self, name: &str) -> NetworkResult<DuplexStream> {
        let endpoints = self
            .endpoints
            .lock()
            .map_err(|_| NetworkError::ConnectionFailed(name.to_string(), "hub poisoned".into()))?;
        let tx = endpoints
            .get(name)
            .ok_or_else(|| NetworkError::UnknownEndpoint(name.to_string()))?;
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(remote)
            .map_err(|_| NetworkError::UnknownEndpoint(name.to_string()))?;
        Ok(local)
    }
}

/// Accepting side of a bound endpoint. Unregisters itself on drop.
#[derive(Debug)]
pub struct InprocListener {
    name: String,
    rx: mpsc::UnboundedReceiver<DuplexStream>,
    endpoints: Registry,
}

impl InprocListener {
    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl Drop for InprocListener {
    fn drop(&mut self) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connects_named_endpoints() {
        let hub = InprocHub::new();
        let mut listener = hub.bind("relay").unwrap();
        assert!(hub.bind("relay").is_err());

        let mut client = hub.connect("relay").unwrap();
        let mut server = listener.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(matches!(
            hub.connect("relay"),
            Err(NetworkError::UnknownEndpoint(_))
        ));
    }
}
