//! Gossip framing.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON-encoded
//! [`GossipMessage`]. Record maps are `BTreeMap`s, so a given state always
//! encodes to the same bytes.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DnsError, Result};
use crate::gossip::state::KvRecords;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// First frame on every connection.
    Hello {
        /// Sender's node name.
        node: String,
        /// Mesh channel; peers on other channels are dropped.
        channel: String,
    },
    /// Complete state, sent on connect and on every sync interval.
    State {
        /// Every entry, tombstones included.
        records: KvRecords,
    },
    /// Entries that changed since the last broadcast.
    Delta {
        /// Changed entries.
        records: KvRecords,
    },
}

impl GossipMessage {
    /// Serialize to a frame payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DnsError::Encode(e.to_string()))
    }

    /// Parse a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| DnsError::GossipMergeDecode(e.to_string()))
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(DnsError::Encode(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"),
        )
        .into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Encode and write a message.
pub async fn write_message<W>(writer: &mut W, message: &GossipMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &message.encode()?).await
}
