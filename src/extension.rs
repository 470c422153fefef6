//! Extension protocol (BEP 10) and metadata exchange (BEP 9).
//!
//! The extension protocol rides on Extended messages (id 20): the first
//! payload byte selects the extension, the rest is bencoded. Extension id 0
//! is the extended handshake where both sides advertise the extensions they
//! speak in the `m` dictionary. The metadata exchange transfers the info
//! dictionary in 16 KiB pieces, which is how a magnet link download learns
//! the torrent description without a .torrent file.

use std::collections::BTreeMap;

use crate::{
    bencode::{Dictionary, Element, Parser},
    error::Error,
};

/// The extended message id we assign to the metadata exchange in our own
/// handshake.
pub const UT_METADATA_ID: u8 = 3;

/// Metadata travels in pieces of 16 KiB, the last one may be shorter.
pub const METADATA_PIECE_LEN: u64 = 1 << 14;

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

/// The extended handshake payload, extension id 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    /// The id the remote chose for ut_metadata messages, if it supports the
    /// metadata exchange.
    pub ut_metadata: Option<u8>,
    /// Size in bytes of the info dictionary, if the remote knows it.
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    /// The handshake advertising what this client supports.
    pub fn supported(metadata_size: Option<u64>) -> Self {
        Self { ut_metadata: Some(UT_METADATA_ID), metadata_size }
    }

    pub fn to_bencode(&self) -> Vec<u8> {
        let mut m = Dictionary::new();
        if let Some(id) = self.ut_metadata {
            m.insert(b"ut_metadata".to_vec(), Element::Integer(id as i64));
        }
        let mut root = Dictionary::new();
        root.insert(b"m".to_vec(), Element::Dictionary(m));
        if let Some(size) = self.metadata_size {
            root.insert(
                b"metadata_size".to_vec(),
                Element::Integer(size as i64),
            );
        }
        Element::Dictionary(root).encode()
    }

    pub fn from_bencode(buf: &[u8]) -> Result<Self, Error> {
        let root = Element::decode(buf)?;
        let ut_metadata = root
            .get(b"m")
            .and_then(|m| m.get(b"ut_metadata"))
            .and_then(Element::as_integer)
            .map(|id| id as u8);
        let metadata_size = root
            .get(b"metadata_size")
            .and_then(Element::as_integer)
            .filter(|size| *size >= 0)
            .map(|size| size as u64);
        Ok(Self { ut_metadata, metadata_size })
    }
}

/// A message of the metadata exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    /// Ask the remote for one metadata piece.
    Request(u64),
    /// One metadata piece: index, total size of the info dictionary and the
    /// raw bytes of this piece.
    Data(u64, u64, Vec<u8>),
    /// The remote cannot serve the requested piece.
    Reject(u64),
}

impl Metadata {
    fn dict(msg_type: i64, piece: u64) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(b"msg_type".to_vec(), Element::Integer(msg_type));
        dict.insert(b"piece".to_vec(), Element::Integer(piece as i64));
        dict
    }

    /// Serialize into an Extended message payload (without the extension id
    /// byte). Data messages append the raw piece bytes after the dictionary.
    pub fn to_bencode(&self) -> Vec<u8> {
        match self {
            Metadata::Request(piece) => {
                Element::Dictionary(Self::dict(MSG_REQUEST, *piece)).encode()
            }
            Metadata::Data(piece, total_size, payload) => {
                let mut dict = Self::dict(MSG_DATA, *piece);
                dict.insert(
                    b"total_size".to_vec(),
                    Element::Integer(*total_size as i64),
                );
                let mut buf = Element::Dictionary(dict).encode();
                buf.extend_from_slice(payload);
                buf
            }
            Metadata::Reject(piece) => {
                Element::Dictionary(Self::dict(MSG_REJECT, *piece)).encode()
            }
        }
    }

    /// Parse a metadata message. Data messages carry their payload after
    /// the bencoded dictionary, the parser position tells where the split
    /// is.
    pub fn from_bencode(buf: &[u8]) -> Result<Self, Error> {
        let mut parser = Parser::new(buf);
        let dict = parser.parse()?;

        let msg_type = dict
            .get(b"msg_type")
            .and_then(Element::as_integer)
            .ok_or(Error::MessageResponse)?;
        let piece = dict
            .get(b"piece")
            .and_then(Element::as_integer)
            .ok_or(Error::MessageResponse)? as u64;

        match msg_type {
            MSG_REQUEST => Ok(Metadata::Request(piece)),
            MSG_DATA => {
                let total_size = dict
                    .get(b"total_size")
                    .and_then(Element::as_integer)
                    .ok_or(Error::MessageResponse)?
                    as u64;
                let payload = buf[parser.pos()..].to_vec();
                Ok(Metadata::Data(piece, total_size, payload))
            }
            MSG_REJECT => Ok(Metadata::Reject(piece)),
            _ => Err(Error::MessageResponse),
        }
    }
}

/// One 16 KiB slice of the raw info dictionary, served to peers requesting
/// metadata.
pub fn info_piece(raw_info: &[u8], piece: u64) -> Option<&[u8]> {
    let start = piece.checked_mul(METADATA_PIECE_LEN)?;
    if start >= raw_info.len() as u64 {
        return None;
    }
    let end = (start + METADATA_PIECE_LEN).min(raw_info.len() as u64);
    Some(&raw_info[start as usize..end as usize])
}

/// Reassembles the info dictionary fetched piece by piece from a peer.
#[derive(Debug, Default)]
pub struct MetadataBuffer {
    total_size: u64,
    pieces: BTreeMap<u64, Vec<u8>>,
}

impl MetadataBuffer {
    pub fn new(total_size: u64) -> Self {
        Self { total_size, pieces: BTreeMap::new() }
    }

    pub fn piece_count(&self) -> u64 {
        self.total_size.div_ceil(METADATA_PIECE_LEN)
    }

    /// Pieces not yet received, in order.
    pub fn missing(&self) -> Vec<u64> {
        (0..self.piece_count())
            .filter(|piece| !self.pieces.contains_key(piece))
            .collect()
    }

    pub fn insert(&mut self, piece: u64, data: Vec<u8>) {
        if piece < self.piece_count() {
            self.pieces.insert(piece, data);
        }
    }

    /// Forget everything, used when the assembled dictionary failed its
    /// hash check.
    pub fn clear(&mut self) {
        self.pieces.clear();
    }

    /// Concatenate the pieces once all of them are present and their sizes
    /// add up.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.missing().is_empty() {
            return None;
        }
        let raw: Vec<u8> =
            self.pieces.values().flatten().copied().collect();
        if raw.len() as u64 != self.total_size {
            return None;
        }
        Some(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_handshake_roundtrip() {
        let ours = ExtendedHandshake::supported(Some(31337));
        let encoded = ours.to_bencode();
        assert_eq!(
            encoded,
            b"d1:md11:ut_metadatai3ee13:metadata_sizei31337ee"
        );

        let parsed = ExtendedHandshake::from_bencode(&encoded).unwrap();
        assert_eq!(parsed, ours);
    }

    #[test]
    fn extended_handshake_without_metadata() {
        let parsed = ExtendedHandshake::from_bencode(b"d1:mdee").unwrap();
        assert_eq!(parsed.ut_metadata, None);
        assert_eq!(parsed.metadata_size, None);
    }

    #[test]
    fn extended_handshake_ignores_negative_sizes() {
        let parsed = ExtendedHandshake::from_bencode(
            b"d1:md11:ut_metadatai2ee13:metadata_sizei-5ee",
        )
        .unwrap();
        assert_eq!(parsed.ut_metadata, Some(2));
        assert_eq!(parsed.metadata_size, None);
    }

    #[test]
    fn metadata_request_roundtrip() {
        let msg = Metadata::Request(2);
        let encoded = msg.to_bencode();
        assert_eq!(encoded, b"d8:msg_typei0e5:piecei2ee");
        assert_eq!(Metadata::from_bencode(&encoded).unwrap(), msg);
    }

    #[test]
    fn metadata_data_splits_payload_from_dictionary() {
        let msg = Metadata::Data(0, 4, b"info".to_vec());
        let encoded = msg.to_bencode();
        assert_eq!(
            encoded,
            b"d8:msg_typei1e5:piecei0e10:total_sizei4eeinfo"
        );
        assert_eq!(Metadata::from_bencode(&encoded).unwrap(), msg);
    }

    #[test]
    fn metadata_reject_roundtrip() {
        let msg = Metadata::Reject(1);
        let encoded = msg.to_bencode();
        assert_eq!(Metadata::from_bencode(&encoded).unwrap(), msg);
    }

    #[test]
    fn serves_info_pieces() {
        let raw = vec![1u8; METADATA_PIECE_LEN as usize + 100];
        assert_eq!(
            info_piece(&raw, 0).unwrap().len(),
            METADATA_PIECE_LEN as usize
        );
        assert_eq!(info_piece(&raw, 1).unwrap().len(), 100);
        assert!(info_piece(&raw, 2).is_none());
    }

    #[test]
    fn reassembles_in_order() {
        let total = METADATA_PIECE_LEN + 3;
        let mut buffer = MetadataBuffer::new(total);
        assert_eq!(buffer.piece_count(), 2);
        assert_eq!(buffer.missing(), vec![0, 1]);

        buffer.insert(1, vec![9, 9, 9]);
        assert_eq!(buffer.missing(), vec![0]);
        assert!(buffer.assemble().is_none());

        buffer.insert(0, vec![1; METADATA_PIECE_LEN as usize]);
        let raw = buffer.assemble().unwrap();
        assert_eq!(raw.len() as u64, total);
        assert_eq!(&raw[raw.len() - 3..], &[9, 9, 9]);
    }
}
