//! Connection flavours behind one interface.
//!
//! The pool only ever calls `connect`, `init` and `transmit`; which transport
//! sits underneath is fixed when the connection is built from the peer's
//! address (or from an accepted stream).
use std::time::Duration;

use bitcoin::p2p::{message::NetworkMessage, Magic, ServiceFlags};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time,
};

use super::{
    frame::{encode_message, FrameReader},
    inproc::{InprocHub, InprocListener},
    PeerAddress, PeerEvent, Protocol, Transport,
};
use crate::{
    actor::Mailbox,
    error::{NetworkError, NetworkResult},
    pending::{pending, Pending, Resolver},
    types::PeerId,
};

/// A connected byte stream.
#[derive(Debug)]
pub enum Stream {
    /// TCP socket.
    Tcp(TcpStream),
    /// In-process pipe.
    Inproc(DuplexStream),
}

#[derive(Debug)]
enum Flavor {
    Tcp,
    Inproc(InprocHub),
    Incoming,
}

struct Outbound {
    frame: Vec<u8>,
    delivered: Resolver<bool>,
}

/// One peer connection.
pub struct Connection {
    address: PeerAddress,
    flavor: Flavor,
    magic: Magic,
    stream: Option<Stream>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("flavor", &self.flavor)
            .field("registered", &self.outbound.is_some())
            .finish()
    }
}

impl Connection {
    /// Outbound connection; the transport follows the address.
    pub fn outgoing(address: PeerAddress, magic: Magic, hub: &InprocHub) -> Self {
        let flavor = match address.transport() {
            Transport::Tcp => Flavor::Tcp,
            Transport::Inproc => Flavor::Inproc(hub.clone()),
        };
        Self {
            address,
            flavor,
            magic,
            stream: None,
            outbound: None,
            tasks: Vec::new(),
        }
    }

    /// Connection around a stream accepted by a [`Listener`].
    pub fn incoming(address: PeerAddress, stream: Stream, magic: Magic) -> Self {
        Self {
            address,
            flavor: Flavor::Incoming,
            magic,
            stream: Some(stream),
            outbound: None,
            tasks: Vec::new(),
        }
    }

    /// Remote address.
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Remote host.
    pub fn host(&self) -> &str {
        self.address.host()
    }

    /// Remote port.
    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Whether this connection was accepted rather than dialled.
    pub fn is_incoming(&self) -> bool {
        matches!(self.flavor, Flavor::Incoming)
    }

    /// Establish the byte stream. Accepted connections are already connected.
    pub async fn connect(&mut self, timeout: Duration) -> NetworkResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = match &self.flavor {
            Flavor::Tcp => {
                let socket = self.address.socket_addr().ok_or_else(|| {
                    NetworkError::ConnectionFailed(self.address.to_string(), "no socket".into())
                })?;
                let stream = time::timeout(timeout, TcpStream::connect(socket))
                    .await
                    .map_err(|_| NetworkError::Timeout)?
                    .map_err(|e| NetworkError::ConnectionFailed(socket.to_string(), e.to_string()))?;
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            }
            Flavor::Inproc(hub) => Stream::Inproc(hub.connect(self.address.host())?),
            Flavor::Incoming => return Err(NetworkError::NotConnected),
        };
        tracing::debug!(peer = %self.address, "connected");
        self.stream = Some(stream);
        Ok(())
    }

    /// Register the connection under `id`: start the reader and writer tasks
    /// delivering decoded messages to `sink`. Returns `false` when there is
    /// no stream to register.
    pub fn init<M>(&mut self, id: PeerId, sink: Mailbox<M>) -> bool
    where
        M: From<PeerEvent> + Send + 'static,
    {
        let Some(stream) = self.stream.take() else {
            return false;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.tasks = match stream {
            Stream::Tcp(s) => start(s, id, self.magic, sink, rx),
            Stream::Inproc(s) => start(s, id, self.magic, sink, rx),
        };
        self.outbound = Some(tx);
        true
    }

    /// Queue `message`; the handle resolves once it was written (or failed).
    pub fn transmit(&self, message: NetworkMessage) -> Pending<bool> {
        let Some(outbound) = &self.outbound else {
            return Pending::ready(false);
        };
        let (delivered, handle) = pending();
        let frame = encode_message(self.magic, message);
        if let Err(mpsc::error::SendError(rejected)) = outbound.send(Outbound { frame, delivered }) {
            rejected.delivered.resolve(false);
        }
        handle
    }

    /// Stop the reader and writer tasks.
    pub fn close(&mut self) {
        self.outbound = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn start<S, M>(
    stream: S,
    id: PeerId,
    magic: Magic,
    sink: Mailbox<M>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Vec<JoinHandle<()>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    M: From<PeerEvent> + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let reader_sink = sink.clone();
    let reader = tokio::spawn(async move {
        let mut frames = FrameReader::new(magic);
        loop {
            match frames.next(&mut read_half).await {
                Ok(message) => {
                    if reader_sink
                        .send(M::from(PeerEvent::Message(id, message)))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(%id, "read failed: {e}");
                    let _ = reader_sink.send(M::from(PeerEvent::Disconnected(id, e.to_string())));
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(Outbound { frame, delivered }) = outbound.recv().await {
            let written = write_half.write_all(&frame).await;
            let flushed = match written {
                Ok(()) => write_half.flush().await,
                Err(e) => Err(e),
            };
            match flushed {
                Ok(()) => delivered.resolve(true),
                Err(e) => {
                    delivered.resolve(false);
                    tracing::debug!(%id, "write failed: {e}");
                    let _ = sink.send(M::from(PeerEvent::Disconnected(id, e.to_string())));
                    break;
                }
            }
        }
    });

    vec![reader, writer]
}

/// Accepting side for inbound peers.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// In-process endpoint.
    Inproc(InprocListener),
}

impl Listener {
    /// Bind `address` (a TCP socket or an in-process endpoint name).
    pub async fn bind(address: &PeerAddress, hub: &InprocHub) -> NetworkResult<Self> {
        match address.transport() {
            Transport::Tcp => {
                let socket = address.socket_addr().ok_or_else(|| {
                    NetworkError::ConnectionFailed(address.to_string(), "no socket".into())
                })?;
                Ok(Listener::Tcp(TcpListener::bind(socket).await?))
            }
            Transport::Inproc => Ok(Listener::Inproc(hub.bind(address.host())?)),
        }
    }

    /// Wait for the next inbound stream and the address it came from.
    pub async fn accept(&mut self) -> NetworkResult<(Stream, PeerAddress)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((
                    Stream::Tcp(stream),
                    PeerAddress::tcp(Protocol::Bitcoin, remote, ServiceFlags::NONE),
                ))
            }
            Listener::Inproc(listener) => {
                let stream = listener.accept().await.ok_or(NetworkError::NotConnected)?;
                let remote = format!("{}#incoming", listener.name());
                Ok((
                    Stream::Inproc(stream),
                    PeerAddress::inproc(Protocol::Bitcoin, remote, ServiceFlags::NONE),
                ))
            }
        }
    }
}
