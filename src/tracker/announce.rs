//! The announce exchange of the UDP tracker protocol (BEP 15).

use speedy::{BigEndian, Readable, Writable};

use crate::{error::Error, metainfo::InfoHash, peer::PeerId};

use super::{action::Action, event::Event};

/// The 98 byte announce request.
#[derive(Debug, PartialEq, Clone)]
pub struct Request {
    pub connection_id: u64,
    pub action: Action,
    pub transaction_id: u32,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: Event,
    pub ip_address: u32,
    pub key: u32,
    pub num_want: u32,
    pub port: u16,
}

impl Request {
    pub(crate) const LENGTH: usize = 98;

    pub fn new(
        connection_id: u64,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        event: Event,
    ) -> Self {
        Self {
            connection_id,
            action: Action::Announce,
            transaction_id: rand::random::<u32>(),
            info_hash,
            peer_id,
            downloaded: 0,
            left: u64::MAX,
            uploaded: 0,
            event,
            ip_address: 0,
            key: 0,
            num_want: u32::MAX, // -1, let the tracker decide
            port,
        }
    }

    pub fn serialize(&self) -> [u8; Self::LENGTH] {
        let mut buf = [0u8; Self::LENGTH];
        buf[0..8].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[8..12].copy_from_slice(&(self.action as u32).to_be_bytes());
        buf[12..16].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[16..36].copy_from_slice(&self.info_hash.0);
        buf[36..56].copy_from_slice(&self.peer_id.0);
        buf[56..64].copy_from_slice(&self.downloaded.to_be_bytes());
        buf[64..72].copy_from_slice(&self.left.to_be_bytes());
        buf[72..80].copy_from_slice(&self.uploaded.to_be_bytes());
        buf[80..84].copy_from_slice(&(self.event as u32).to_be_bytes());
        buf[84..88].copy_from_slice(&self.ip_address.to_be_bytes());
        buf[88..92].copy_from_slice(&self.key.to_be_bytes());
        buf[92..96].copy_from_slice(&self.num_want.to_be_bytes());
        buf[96..98].copy_from_slice(&self.port.to_be_bytes());
        buf
    }
}

/// Fixed header of the announce response, followed by the compact peer
/// list.
#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Response {
    pub action: u32,
    pub transaction_id: u32,
    /// Seconds until the next announce.
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}

impl Response {
    pub(crate) const MIN_LEN: usize = 20;

    /// Split the fixed header from the trailing compact peer list.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Self::MIN_LEN {
            return Err(Error::TrackerResponseLength);
        }
        let res =
            Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::MIN_LEN])
                .map_err(Error::SpeedyError)?;
        Ok((res, &buf[Self::MIN_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_wire_layout() {
        let req = Request::new(
            0x1122334455667788,
            InfoHash([9u8; 20]),
            PeerId([7u8; 20]),
            8000,
            Event::Started,
        );
        let buf = req.serialize();

        assert_eq!(buf.len(), 98);
        assert_eq!(&buf[0..8], &0x1122334455667788u64.to_be_bytes());
        // action announce
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[16..36], &[9u8; 20]);
        assert_eq!(&buf[36..56], &[7u8; 20]);
        // event started
        assert_eq!(&buf[80..84], &2u32.to_be_bytes());
        // num_want -1
        assert_eq!(&buf[92..96], &[0xff; 4]);
        assert_eq!(&buf[96..98], &8000u16.to_be_bytes());
    }

    #[test]
    fn response_splits_header_and_peer_list() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());
        buf.extend_from_slice(&1800u32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        // one compact peer
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1f, 0x90]);

        let (res, payload) = Response::deserialize(&buf).unwrap();
        assert_eq!(res.action, 1);
        assert_eq!(res.transaction_id, 42);
        assert_eq!(res.interval, 1800);
        assert_eq!(res.leechers, 3);
        assert_eq!(res.seeders, 7);
        assert_eq!(payload, &[127, 0, 0, 1, 0x1f, 0x90]);

        assert!(Response::deserialize(&buf[..10]).is_err());
    }
}
