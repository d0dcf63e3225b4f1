//! # Wire Envelope
//!
//! How events travel between nodes. A connection starts with an 8-byte
//! handshake naming the payload encoding, followed by length-prefixed frames:
//!
//! ```text
//! ┌──────────────────┬────────────┬──────────────┬────────────┬─────
//! │ "SYNQRA\0J" or   │ u32 LE len │ payload      │ u32 LE len │ ...
//! │ "SYNQRA\0B"      │            │ (len bytes)  │            │
//! └──────────────────┴────────────┴──────────────┴────────────┴─────
//!    handshake          frame 1                     frame 2
//! ```
//!
//! Each payload is one [`TransportOperation`], either as JSON (`$type`
//! discriminator, camelCase) or in the binary codec (a signed varint
//! operation code followed by the operation's fields).
//!
//! A clean end-of-stream between frames reads as `None`. End-of-stream in the
//! middle of a frame is an I/O error.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::codec::{from_slice, Decode, Encode, Reader, Serializer, Writer, DEFAULT_MAX_BUFFER};
use crate::error::{Error, Result};
use crate::types::Event;

/// Handshake announcing JSON payloads.
pub const MAGIC_JSON: [u8; 8] = *b"SYNQRA\x00J";

/// Handshake announcing binary payloads.
pub const MAGIC_BINARY: [u8; 8] = *b"SYNQRA\x00B";

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = DEFAULT_MAX_BUFFER;

const OP_NEW_EVENT: i64 = 1;

// =============================================================================
// Formats and Operations
// =============================================================================

/// Payload encoding negotiated by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// camelCase JSON with `$type` discriminators.
    Json,
    /// The crate's binary codec.
    Binary,
}

impl WireFormat {
    /// The handshake bytes for this format.
    pub fn magic(self) -> [u8; 8] {
        match self {
            WireFormat::Json => MAGIC_JSON,
            WireFormat::Binary => MAGIC_BINARY,
        }
    }

    /// Parses handshake bytes.
    pub fn from_magic(magic: &[u8; 8]) -> Result<Self> {
        match *magic {
            MAGIC_JSON => Ok(WireFormat::Json),
            MAGIC_BINARY => Ok(WireFormat::Binary),
            _ => Err(Error::Format(format!(
                "unknown transport handshake {}",
                hex::encode(magic)
            ))),
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "camelCase")]
pub enum TransportOperation {
    /// A new event produced on the sending node.
    NewEvent { event: Event },
}

impl Encode for TransportOperation {
    fn encode(&self, w: &mut Writer<'_>) -> Result<()> {
        match self {
            TransportOperation::NewEvent { event } => {
                w.write_signed(OP_NEW_EVENT)?;
                event.encode(w)
            }
        }
    }
}

impl Decode for TransportOperation {
    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        match r.read_signed()? {
            OP_NEW_EVENT => Ok(TransportOperation::NewEvent {
                event: Event::decode(r)?,
            }),
            other => Err(Error::UnsupportedType(format!(
                "unknown transport operation {other}"
            ))),
        }
    }
}

impl TransportOperation {
    /// Encodes the operation as a frame payload.
    pub fn to_payload(&self, format: WireFormat, serializer: &mut Serializer) -> Result<Vec<u8>> {
        match format {
            WireFormat::Json => Ok(serde_json::to_vec(self)?),
            WireFormat::Binary => serializer.to_vec(self),
        }
    }

    /// Decodes a frame payload.
    pub fn from_payload(payload: &[u8], format: WireFormat) -> Result<Self> {
        match format {
            WireFormat::Json => Ok(serde_json::from_slice(payload)?),
            WireFormat::Binary => from_slice(payload),
        }
    }
}

// =============================================================================
// Handshake and Framing
// =============================================================================

/// Sends the handshake for `format`.
pub async fn write_handshake<W>(writer: &mut W, format: WireFormat) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&format.magic()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and parses the peer's handshake.
pub async fn read_handshake<R>(reader: &mut R) -> Result<WireFormat>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).await?;
    let format = WireFormat::from_magic(&magic)?;
    debug!(?format, "transport handshake");
    Ok(format)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Argument(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            payload.len()
        )));
    }
    // Bounded by MAX_FRAME_LEN above.
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `None` on a clean end-of-stream before the header.
///
/// # Errors
///
/// [`Error::Format`] if the stream ends inside the 4-byte header.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    match reader.read_exact(&mut header[1..]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::Format("stream ended inside a frame header".to_string()))
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Format(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Encodes and writes one operation.
pub async fn write_operation<W>(
    writer: &mut W,
    format: WireFormat,
    serializer: &mut Serializer,
    operation: &TransportOperation,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = operation.to_payload(format, serializer)?;
    write_frame(writer, &payload).await
}

/// Reads and decodes one operation. `None` at end-of-stream.
pub async fn read_operation<R>(reader: &mut R, format: WireFormat) -> Result<Option<TransportOperation>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(TransportOperation::from_payload(&payload, format)?)),
        None => Ok(None),
    }
}

// =============================================================================
// Tests
// =============================================================================
