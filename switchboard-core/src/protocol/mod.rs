//! AudioSocket framed-TCP protocol.
//!
//! ## Wire format
//!
//! ```text
//! [type: u8][length: u16 big-endian][payload: length bytes]
//! ```
//!
//! | Type | Code | Payload |
//! |------|------|---------|
//! | HANGUP | 0x00 | empty |
//! | UUID   | 0x01 | 36-byte ASCII call id, optional trailing extension |
//! | DTMF   | 0x03 | single ASCII digit from `0-9*#A-D` |
//! | AUDIO  | 0x10 | signed 16-bit PCM, 8 kHz, mono, little-endian |
//! | ERROR  | 0xFF | UTF-8 message |
//!
//! The codec is stateless and buffers nothing beyond one frame. Partial
//! reads are protocol errors, never silent truncations.

pub mod connection;
pub mod queue;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SwitchboardError};

/// Maximum payload size. Audio at 8 kHz 16-bit mono is 16 KB/s, so this
/// allows about four seconds in a single frame.
pub const MAX_PAYLOAD: usize = 65_536;

/// AudioSocket message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hangup = 0x00,
    Uuid = 0x01,
    Dtmf = 0x03,
    Audio = 0x10,
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = SwitchboardError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(MessageType::Hangup),
            0x01 => Ok(MessageType::Uuid),
            0x03 => Ok(MessageType::Dtmf),
            0x10 => Ok(MessageType::Audio),
            0xFF => Ok(MessageType::Error),
            other => Err(SwitchboardError::Protocol(format!(
                "unknown frame type 0x{other:02X}"
            ))),
        }
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn hangup() -> Self {
        Self::new(MessageType::Hangup, Vec::new())
    }

    pub fn audio(payload: Vec<u8>) -> Self {
        Self::new(MessageType::Audio, payload)
    }

    /// Read one frame. `Ok(None)` means the peer closed the stream cleanly
    /// between frames; anything torn mid-frame is a protocol error.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
        let type_byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let kind = MessageType::try_from(type_byte)?;

        let mut len_bytes = [0u8; 2];
        reader
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| map_truncation(e, "frame header"))?;
        let length = u16::from_be_bytes(len_bytes) as usize;

        if length > MAX_PAYLOAD {
            return Err(SwitchboardError::Protocol(format!(
                "payload too large: {length} bytes (max {MAX_PAYLOAD})"
            )));
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| map_truncation(e, "frame payload"))?;
        }

        Ok(Some(Frame { kind, payload }))
    }

    /// Encode into wire bytes. Payload length is validated against the
    /// protocol cap.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD.min(u16::MAX as usize) {
            return Err(SwitchboardError::Protocol(format!(
                "payload too large to encode: {} bytes",
                self.payload.len()
            )));
        }
        let mut bytes = Vec::with_capacity(3 + self.payload.len());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// DTMF payload as a digit, if this is a well-formed DTMF frame.
    pub fn as_dtmf(&self) -> Option<char> {
        if self.kind != MessageType::Dtmf {
            return None;
        }
        let digit = *self.payload.first()? as char;
        Some(digit)
    }

    /// Split a UUID payload into the 36-byte call id and the optional
    /// dialed extension carried after it.
    ///
    /// The exact trailing encoding varies by dial plan; leading separator
    /// characters and NULs are stripped, and an empty remainder means the
    /// caller reached the default operator.
    pub fn uuid_parts(&self) -> Result<(String, Option<String>)> {
        if self.kind != MessageType::Uuid {
            return Err(SwitchboardError::Protocol(
                "frame is not a UUID frame".into(),
            ));
        }
        if self.payload.len() < 36 {
            return Err(SwitchboardError::Protocol(format!(
                "UUID payload too short: {} bytes",
                self.payload.len()
            )));
        }
        let id = std::str::from_utf8(&self.payload[..36])
            .map_err(|_| SwitchboardError::Protocol("UUID payload is not ASCII".into()))?
            .trim()
            .to_string();
        uuid::Uuid::parse_str(&id)
            .map_err(|e| SwitchboardError::Protocol(format!("malformed call id: {e}")))?;

        let extension = std::str::from_utf8(&self.payload[36..])
            .map_err(|_| SwitchboardError::Protocol("extension payload is not ASCII".into()))?
            .trim_matches(|c: char| c == '/' || c == ':' || c == '|' || c == '\0' || c.is_whitespace())
            .to_string();

        Ok((
            id,
            if extension.is_empty() {
                None
            } else {
                Some(extension)
            },
        ))
    }
}

fn map_truncation(e: std::io::Error, what: &str) -> SwitchboardError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SwitchboardError::Protocol(format!("connection closed mid-{what}"))
    } else {
        e.into()
    }
}

/// Write an AUDIO frame.
pub async fn write_audio<W: AsyncWrite + Unpin>(writer: &mut W, audio: &[u8]) -> Result<()> {
    Frame::audio(audio.to_vec()).write(writer).await
}

/// Write a HANGUP frame.
pub async fn write_hangup<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    Frame::hangup().write(writer).await
}
