//! Display-name preamble exchanged at the start of every LAN connection.
//!
//! Wire format (sent by both ends, in both directions):
//! ```text
//! [name_len:1][name:name_len UTF-8 bytes]
//! ```
//!
//! Names are limited to 248 bytes, the same limit a Bluetooth device name has.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ProtocolError;

/// Longest display name, in bytes.
pub const MAX_NAME_LEN: usize = 248;

/// Writes `name` as a length-prefixed preamble.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidName`] if the name is empty or too long,
/// or [`ProtocolError::Io`] if the write fails.
pub async fn write_preamble<W>(writer: &mut W, name: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return Err(ProtocolError::InvalidName(format!(
            "name must be 1..={MAX_NAME_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut buf = Vec::with_capacity(1 + bytes.len());
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a preamble and returns the peer's display name.
///
/// # Errors
///
/// Returns [`ProtocolError::Io`] if the stream ends early and
/// [`ProtocolError::InvalidName`] for empty, oversized, or non-UTF-8 names.
pub async fn read_preamble<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u8().await? as usize;
    if len == 0 || len > MAX_NAME_LEN {
        return Err(ProtocolError::InvalidName(format!(
            "declared name length {len} out of range"
        )));
    }
    let mut name = vec![0u8; len];
    reader.read_exact(&mut name).await?;
    String::from_utf8(name).map_err(|e| ProtocolError::InvalidName(format!("invalid UTF-8: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
