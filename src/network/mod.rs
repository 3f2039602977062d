//! Network Module
//!
//! TCP transport between the manager and its clients.

mod server;
mod client;

pub use server::NetworkServer;
pub use client::NetworkClient;

use crate::error::{Error, Result};
use crate::protocol::{FrameHeader, WireMessage};

/// Read a framed message from a reader
pub async fn read_message<M, R>(reader: &mut R) -> Result<M>
where
    M: WireMessage,
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Message length {} exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(M::from_bytes(&body)?)
}

/// Write a framed message to a writer
pub async fn write_message<M, W>(writer: &mut W, message: &M) -> Result<()>
where
    M: WireMessage,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let body = message.to_bytes()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
