//! Bitcoin P2P framing.
//!
//! Each message is read in four steps: wait for the 24-byte header, parse
//! the declared payload length, wait for the payload, then decode and
//! deliver the complete frame.
use bitcoin::{
    consensus::encode,
    p2p::{
        message::{NetworkMessage, RawNetworkMessage},
        Magic,
    },
};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{DecodeError, NetworkError, NetworkResult};

/// Size of the message header (magic, command, length, checksum).
pub const HEADER_SIZE: usize = 24;
/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD: usize = 32 * 1024 * 1024;

/// Where the reader is in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Waiting for the header bytes.
    AwaitHeader,
    /// Header complete; payload length not yet validated.
    ParseLength,
    /// Waiting for `len` payload bytes.
    AwaitBody(usize),
    /// Frame complete, ready to decode.
    Deliver,
}

/// Incremental frame reader for one connection.
#[derive(Debug)]
pub struct FrameReader {
    magic: Magic,
    state: FrameState,
    frame: Vec<u8>,
}

impl FrameReader {
    /// Reader expecting frames for `magic`.
    pub fn new(magic: Magic) -> Self {
        Self {
            magic,
            state: FrameState::AwaitHeader,
            frame: Vec::with_capacity(HEADER_SIZE),
        }
    }

    /// Current state.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Read the next complete message from `reader`.
    pub async fn next<R>(&mut self, reader: &mut R) -> NetworkResult<NetworkMessage>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match self.state {
                FrameState::AwaitHeader => {
                    self.frame.clear();
                    self.frame.resize(HEADER_SIZE, 0);
                    read_exact(reader, &mut self.frame[..]).await?;
                    self.state = FrameState::ParseLength;
                }
                FrameState::ParseLength => {
                    let len = match payload_len(self.magic, &self.frame[..HEADER_SIZE]) {
                        Ok(len) => len,
                        Err(e) => {
                            self.state = FrameState::AwaitHeader;
                            return Err(e.into());
                        }
                    };
                    self.state = FrameState::AwaitBody(len);
                }
                FrameState::AwaitBody(len) => {
                    self.frame.resize(HEADER_SIZE + len, 0);
                    read_exact(reader, &mut self.frame[HEADER_SIZE..]).await?;
                    self.state = FrameState::Deliver;
                }
                FrameState::Deliver => {
                    self.state = FrameState::AwaitHeader;
                    let raw: RawNetworkMessage = encode::deserialize(&self.frame)?;
                    tracing::trace!(command = %raw.command(), bytes = self.frame.len(), "frame");
                    return Ok(raw.payload().clone());
                }
            }
        }
    }
}

/// Validate a header and return the declared payload length.
pub fn payload_len(magic: Magic, header: &[u8]) -> Result<usize, DecodeError> {
    if header[..4] != magic.to_bytes() {
        return Err(DecodeError::WrongMagic(hex::encode(&header[..4])));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[16..20]);
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_PAYLOAD {
        return Err(DecodeError::Oversize(len));
    }
    Ok(len)
}

/// Serialize `message` into a complete frame.
pub fn encode_message(magic: Magic, message: NetworkMessage) -> Vec<u8> {
    encode::serialize(&RawNetworkMessage::new(magic, message))
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> NetworkResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(NetworkError::PeerDisconnected)
        }
        Err(e) => Err(NetworkError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let magic = Magic::from(Network::Regtest);
        let mut bytes = encode_message(magic, NetworkMessage::Ping(7));
        bytes.extend(encode_message(magic, NetworkMessage::Verack));

        let mut reader = FrameReader::new(magic);
        let mut input = &bytes[..];
        assert_eq!(
            reader.next(&mut input).await.unwrap(),
            NetworkMessage::Ping(7)
        );
        assert_eq!(reader.next(&mut input).await.unwrap(), NetworkMessage::Verack);
        assert_eq!(reader.state(), FrameState::AwaitHeader);
        assert!(matches!(
            reader.next(&mut input).await,
            Err(NetworkError::PeerDisconnected)
        ));
    }

    #[tokio::test]
    async fn rejects_foreign_magic() {
        let bytes = encode_message(Magic::from(Network::Bitcoin), NetworkMessage::Verack);
        let mut reader = FrameReader::new(Magic::from(Network::Regtest));
        let mut input = &bytes[..];
        assert!(matches!(
            reader.next(&mut input).await,
            Err(NetworkError::Frame(DecodeError::WrongMagic(_)))
        ));
    }

    #[test]
    fn rejects_oversize_length() {
        let magic = Magic::from(Network::Regtest);
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&magic.to_bytes());
        header[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(
            payload_len(magic, &header),
            Err(DecodeError::Oversize(u32::MAX as usize))
        );
    }
}
