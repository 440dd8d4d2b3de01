//! Wire formats spoken by the LAN radio adapter.
//!
//! - **`discovery`** – UDP inquiry datagrams: a `Probe` broadcast by the
//!   scanning device and the `Beacon` every advertising device answers with.
//! - **`preamble`** – the display-name exchange at the start of every TCP
//!   connection, which is how each end learns `remote_peer_name`.

pub mod discovery;
pub mod preamble;

use thiserror::Error;

pub use discovery::{decode_discovery, encode_discovery, DiscoveryMessage, DISCOVERY_MAGIC};
pub use preamble::{read_preamble, write_preamble, MAX_NAME_LEN};

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The datagram does not start with the NearChat magic bytes.
    #[error("bad magic bytes")]
    BadMagic,

    /// The datagram body could not be (de)serialized.
    #[error("malformed datagram: {0}")]
    Malformed(#[from] bincode::Error),

    /// A display name is empty, too long, or not UTF-8.
    #[error("invalid display name: {0}")]
    InvalidName(String),

    /// The stream ended or failed while exchanging the preamble.
    #[error("preamble I/O error: {0}")]
    Io(#[from] std::io::Error),
}
