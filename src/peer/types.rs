use std::fmt::Display;

use rand::{distr::Alphanumeric, Rng};
use speedy::{Readable, Writable};

/// Id a peer presents in its handshake. Ours is generated once per client
/// run: an ASCII client prefix followed by random alphanumerics.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-MS0100-");

        for byte in peer_id.iter_mut().skip(8) {
            *byte = rand::rng().sample(Alphanumeric);
        }

        PeerId(peer_id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Determines who initiated the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outbound means we initiated the connection.
    Outbound,
    /// Inbound means the peer initiated the connection.
    Inbound,
}

/// Where a session currently is in its lifecycle. A disconnected peer has
/// no state, its session ends instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP is up, the handshake exchange is in flight.
    Connected,
    /// Handshake validated, our bitfield and unchoke are on the wire.
    Handshook,
    /// Waiting for a piece to download.
    Idle,
    /// A piece is assigned and block requests are in flight.
    DownloadingPiece,
}

/// Messages other parts of the client send to a running peer session.
#[derive(Debug)]
pub enum PeerMsg {
    /// We completed a piece, tell the peer if it doesn't have it.
    HavePiece(u64),
    /// The client is shutting down, end the session.
    Quit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids_have_the_client_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.0[..8], b"-MS0100-");
        assert!(id.0[8..].iter().all(u8::is_ascii_alphanumeric));

        let other = PeerId::generate();
        assert_ne!(id.0, other.0);
    }
}
