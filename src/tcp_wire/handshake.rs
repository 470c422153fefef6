//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. Thus, after receiving and sending a handshake the codec
//! should be switched to [`super::MessageCodec`], but care should be taken
//! not to discard the underlying receive and send buffers.

use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

/// The protocol string of the first handshake byte block.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

#[derive(Debug)]
pub struct HandshakeCodec;

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// or the info hash differs from ours, the connection is severed. The
/// reserved field is 8 zero bytes except bit 5 of byte 5, which advertises
/// extension protocol support. The peer id is usually the client name and
/// version.
#[derive(Clone, Debug, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];

        // we support the extension protocol, bit 44 counted from the left
        reserved[5] |= 0x10;

        Self { pstr_len: 19, pstr: PSTR, reserved, info_hash, peer_id }
    }

    pub fn serialize(&self) -> Result<[u8; 68], Error> {
        let mut buf = [0u8; 68];
        let temp = self
            .write_to_vec_with_ctx(BigEndian {})
            .map_err(Error::SpeedyError)?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Self::read_from_buffer_with_ctx(BigEndian {}, buf)
            .map_err(Error::SpeedyError)
    }

    /// Whether the remote handshake is acceptable for our torrent.
    pub fn validate(&self, target: &Self) -> bool {
        if target.pstr_len != 19 || target.pstr != PSTR {
            warn!("handshake with wrong protocol string, dropping connection");
            return false;
        }
        if self.info_hash != target.info_hash {
            warn!("info_hash from received handshake does not match ours");
            return false;
        }
        true
    }

    /// Whether the remote supports the extension protocol (BEP 10).
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake { pstr, reserved, info_hash, peer_id, .. } = handshake;

        buf.put_u8(pstr.len() as u8);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash.0);
        buf.extend_from_slice(&peer_id.0);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the protocol string length, the buffer cursor must not
        // move until the whole handshake is present
        let mut tmp_buf = Cursor::new(&buf);
        let prot_len = tmp_buf.get_u8() as usize;
        if prot_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "handshake must start with the string \"BitTorrent protocol\"",
            ));
        }

        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() < 1 + payload_len {
            return Ok(None);
        }
        buf.advance(1);

        // protocol string
        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        // reserved field
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        // info hash
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        // peer id
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len: pstr.len() as u8,
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}
