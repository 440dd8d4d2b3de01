//! Radio transport adapters.
//!
//! # Sub-modules
//!
//! - **`lan`** – TCP connections and UDP broadcast inquiry on the local
//!   network.  Each connection opens with a name preamble so both ends know
//!   who they are talking to.
//!
//! - **`loopback`** – An in-process medium shared by simulated devices.  Used
//!   by the tests and for trying the node without a network.
//!
//! Both adapters follow the one-message-per-connection contract: the writer
//! sends its payload and shuts down its half, the reader reads until end of
//! stream or until its buffer is full.

use tokio::io::{AsyncRead, AsyncReadExt};

pub mod lan;
pub mod loopback;

/// Reads until end of stream or until `buf` is full.
pub(crate) async fn read_message<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_message_stops_at_end_of_stream() {
        // Arrange – two separate writes, then EOF
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"he").await.unwrap();
        a.write_all(b"llo").await.unwrap();
        a.shutdown().await.unwrap();

        // Act
        let mut buf = [0u8; 32];
        let n = read_message(&mut b, &mut buf).await.unwrap();

        // Assert
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_message_stops_when_buffer_is_full() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"0123456789").await.unwrap();

        let mut buf = [0u8; 4];
        let n = read_message(&mut b, &mut buf).await.unwrap();

        assert_eq!(n, 4);
        assert_eq!(&buf, b"0123");
    }
}
