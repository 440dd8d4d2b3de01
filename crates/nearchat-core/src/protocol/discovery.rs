//! Discovery datagrams.
//!
//! Wire format:
//! ```text
//! [magic:4 = "NCHT"][bincode(DiscoveryMessage)]
//! ```
//!
//! A scanning device broadcasts a `Probe` to the discovery port.  Every
//! device advertising the same service id answers with a unicast `Beacon`
//! naming itself and the TCP port it accepts connections on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProtocolError;

/// Leading bytes of every discovery datagram.
pub const DISCOVERY_MAGIC: [u8; 4] = *b"NCHT";

/// Messages exchanged on the discovery port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    /// Inquiry broadcast by a scanning device.
    Probe { service_id: Uuid },
    /// Answer from an advertising device.
    Beacon {
        service_id: Uuid,
        /// Random per-process id so a device can ignore its own beacon.
        instance: Uuid,
        name: String,
        port: u16,
    },
}

impl DiscoveryMessage {
    pub fn service_id(&self) -> Uuid {
        match self {
            DiscoveryMessage::Probe { service_id } => *service_id,
            DiscoveryMessage::Beacon { service_id, .. } => *service_id,
        }
    }
}

/// Encodes a discovery message with its magic prefix.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if serialization fails.
pub fn encode_discovery(msg: &DiscoveryMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(msg)?;
    let mut buf = Vec::with_capacity(DISCOVERY_MAGIC.len() + body.len());
    buf.extend_from_slice(&DISCOVERY_MAGIC);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decodes a discovery datagram.
///
/// # Errors
///
/// Returns [`ProtocolError::BadMagic`] for foreign datagrams and
/// [`ProtocolError::Malformed`] for truncated or corrupt bodies.
pub fn decode_discovery(bytes: &[u8]) -> Result<DiscoveryMessage, ProtocolError> {
    let body = bytes
        .strip_prefix(&DISCOVERY_MAGIC[..])
        .ok_or(ProtocolError::BadMagic)?;
    Ok(bincode::deserialize(body)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_round_trip_preserves_fields() {
        // Arrange
        let msg = DiscoveryMessage::Beacon {
            service_id: Uuid::new_v4(),
            instance: Uuid::new_v4(),
            name: "Bob".to_string(),
            port: 24900,
        };

        // Act
        let bytes = encode_discovery(&msg).unwrap();
        let decoded = decode_discovery(&bytes).unwrap();

        // Assert
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encoded_datagram_starts_with_magic() {
        let msg = DiscoveryMessage::Probe {
            service_id: Uuid::nil(),
        };
        let bytes = encode_discovery(&msg).unwrap();
        assert_eq!(&bytes[..4], b"NCHT");
    }

    #[test]
    fn test_decode_rejects_foreign_datagram() {
        let result = decode_discovery(b"HTTP/1.1 200 OK");
        assert!(matches!(result, Err(ProtocolError::BadMagic)));
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        // Arrange – a valid beacon cut in half
        let msg = DiscoveryMessage::Beacon {
            service_id: Uuid::new_v4(),
            instance: Uuid::new_v4(),
            name: "Carol".to_string(),
            port: 1,
        };
        let bytes = encode_discovery(&msg).unwrap();

        // Act
        let result = decode_discovery(&bytes[..bytes.len() / 2]);

        // Assert
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_service_id_is_available_for_both_variants() {
        let id = Uuid::new_v4();
        assert_eq!(DiscoveryMessage::Probe { service_id: id }.service_id(), id);
        let beacon = DiscoveryMessage::Beacon {
            service_id: id,
            instance: Uuid::nil(),
            name: "x".to_string(),
            port: 0,
        };
        assert_eq!(beacon.service_id(), id);
    }
}
