//! Torrent description and live download state.
//!
//! A [`Metainfo`] comes either from a .torrent file, in which case it is
//! ready immediately, or from a magnet link, in which case only the info
//! hash and the trackers are known and the rest arrives later through the
//! metadata exchange extension via [`Metainfo::load_info`].

use std::{
    fmt::Display,
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use sha1::{Digest, Sha1};
use speedy::{Readable, Writable};
use tokio::sync::watch;

use crate::{
    bencode::{self, Element},
    error::Error,
    magnet::Magnet,
};

/// SHA-1 of the bencoded info dictionary, the identifier of the swarm.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hash of the raw bencoded info dictionary bytes.
    pub fn hash_of(info: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info);
        InfoHash(hasher.finalize().into())
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = &'static str;
    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("The infohash must have exactly 20 bytes");
        }
        let mut buff = [0u8; 20];
        buff.copy_from_slice(&value[..20]);
        Ok(InfoHash(buff))
    }
}

/// One file of the torrent: its length and its slash-joined path relative
/// to the torrent folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: String,
}

/// The part of the description that is only known once the info dictionary
/// has been loaded.
#[derive(Debug, Default)]
struct Descriptor {
    /// Display name, also the default single-file name.
    name: String,
    /// Name of the working file written to while downloading.
    output_name: String,
    piece_length: u64,
    total_length: u64,
    files: Vec<FileEntry>,
    /// Concatenation of all 20-byte SHA-1 piece hashes.
    piece_hashes: Vec<u8>,
    /// The bencoded info dictionary exactly as received, kept so metadata
    /// requests from other peers can be served.
    raw_info: Vec<u8>,
}

/// Torrent description plus the live counters advertised to trackers.
#[derive(Debug)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub trackers: Vec<String>,

    state: Mutex<Descriptor>,

    downloaded: AtomicU64,
    uploaded: AtomicU64,
    left: AtomicU64,
    pieces_done: AtomicU64,

    /// One-shot latch, true once the info dictionary is loaded.
    ready: watch::Sender<bool>,
}

impl Metainfo {
    /// Build from a source string: a magnet link or a path to a .torrent
    /// file.
    pub async fn new(source: &str) -> Result<Metainfo, Error> {
        if source.starts_with("magnet:") {
            return Self::from_magnet(source);
        }
        let buf = tokio::fs::read(source)
            .await
            .map_err(|_| Error::FileOpenError(source.to_owned()))?;
        Self::from_bytes(&buf)
    }

    fn empty(info_hash: InfoHash, trackers: Vec<String>) -> Metainfo {
        let (ready, _) = watch::channel(false);
        Metainfo {
            info_hash,
            trackers,
            state: Mutex::new(Descriptor::default()),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            left: AtomicU64::new(0),
            pieces_done: AtomicU64::new(0),
            ready,
        }
    }

    /// Parse a .torrent file. The result is ready: the info dictionary is
    /// part of the file.
    pub fn from_bytes(buf: &[u8]) -> Result<Metainfo, Error> {
        let root = Element::decode(buf)?;

        let info = root.get(b"info").ok_or(Error::MetainfoMissingKey("info"))?;
        let span = bencode::raw_value_span(buf, b"info")?
            .ok_or(Error::MetainfoMissingKey("info"))?;
        let raw_info = buf[span].to_vec();
        let info_hash = InfoHash::hash_of(&raw_info);

        let mut trackers = Vec::new();
        if let Some(announce) = root.get(b"announce") {
            let url = announce
                .as_str()
                .ok_or(Error::MetainfoInvalid("announce is not a string"))?;
            trackers.push(url.to_owned());
        } else if let Some(tiers) = root.get(b"announce-list") {
            let tiers = tiers
                .as_list()
                .ok_or(Error::MetainfoInvalid("announce-list is not a list"))?;
            for tier in tiers {
                for url in tier.as_list().unwrap_or_default() {
                    if let Some(url) = url.as_str() {
                        trackers.push(url.to_owned());
                    }
                }
            }
        } else if root.get(b"url-list").is_some() {
            return Err(Error::MetainfoInvalid("url-list is not supported"));
        } else {
            return Err(Error::MetainfoMissingKey("announce"));
        }

        let metainfo = Self::empty(info_hash, trackers);
        metainfo.load_info(info, raw_info)?;
        Ok(metainfo)
    }

    /// Parse a magnet link. The result is not ready until
    /// [`Metainfo::load_info`] is fed the info dictionary fetched from
    /// peers.
    pub fn from_magnet(link: &str) -> Result<Metainfo, Error> {
        let magnet = Magnet::new(link)?;
        let info_hash = magnet.parse_xt_infohash()?;
        let trackers = magnet.parse_trackers();

        let total_length = magnet.length().unwrap_or(0);
        let metainfo = Self::empty(info_hash, trackers);
        {
            let mut state = metainfo.state.lock().unwrap();
            state.name = magnet.parse_dn();
            state.output_name = format!("{}.tmp", state.name);
            state.total_length = total_length;
        }
        metainfo.left.store(total_length, Ordering::Relaxed);
        Ok(metainfo)
    }

    /// Load the info dictionary, fill in the description and fire the ready
    /// latch. Called at construction for .torrent files and after the
    /// metadata exchange for magnet links.
    pub fn load_info(
        &self,
        info: &Element,
        raw_info: Vec<u8>,
    ) -> Result<(), Error> {
        let name = info
            .get(b"name")
            .and_then(Element::as_str)
            .ok_or(Error::MetainfoMissingKey("name"))?
            .to_owned();

        let piece_length = info
            .get(b"piece length")
            .and_then(Element::as_integer)
            .ok_or(Error::MetainfoMissingKey("piece length"))?;
        if piece_length <= 0 {
            return Err(Error::MetainfoInvalid("piece length must be positive"));
        }
        let piece_length = piece_length as u64;

        let piece_hashes = info
            .get(b"pieces")
            .and_then(Element::as_bytes)
            .ok_or(Error::MetainfoMissingKey("pieces"))?
            .to_vec();
        if piece_hashes.is_empty() || piece_hashes.len() % 20 != 0 {
            return Err(Error::MetainfoInvalid(
                "pieces must be a multiple of 20 bytes",
            ));
        }

        let mut files = Vec::new();
        let mut total_length: u64 = 0;
        if let Some(list) = info.get(b"files") {
            // Multiple file mode, paths are lists of components.
            let list = list
                .as_list()
                .ok_or(Error::MetainfoInvalid("files is not a list"))?;
            for file in list {
                let length = file
                    .get(b"length")
                    .and_then(Element::as_integer)
                    .ok_or(Error::MetainfoMissingKey("length"))?;
                if length <= 0 {
                    return Err(Error::MetainfoInvalid(
                        "file length must be positive",
                    ));
                }
                let components = file
                    .get(b"path")
                    .and_then(Element::as_list)
                    .ok_or(Error::MetainfoMissingKey("path"))?;
                let mut path = String::new();
                for component in components {
                    let component = component.as_str().ok_or(
                        Error::MetainfoInvalid("path component is not UTF-8"),
                    )?;
                    if !path.is_empty() {
                        path.push('/');
                    }
                    path.push_str(component);
                }
                if path.is_empty() {
                    return Err(Error::MetainfoInvalid("file has an empty path"));
                }
                total_length += length as u64;
                files.push(FileEntry { length: length as u64, path });
            }
        } else {
            // Single file mode.
            let length = info
                .get(b"length")
                .and_then(Element::as_integer)
                .ok_or(Error::MetainfoMissingKey("length"))?;
            if length <= 0 {
                return Err(Error::MetainfoInvalid("torrent has no content"));
            }
            total_length = length as u64;
            files.push(FileEntry { length: total_length, path: name.clone() });
        }

        if files.is_empty() || total_length == 0 {
            return Err(Error::MetainfoInvalid("torrent has no content"));
        }

        let piece_count = total_length.div_ceil(piece_length);
        if piece_count != (piece_hashes.len() / 20) as u64 {
            return Err(Error::MetainfoInvalid(
                "piece hashes do not match the file length",
            ));
        }

        let mut state = self.state.lock().unwrap();
        state.output_name = format!("{name}.tmp");
        state.name = name;
        state.piece_length = piece_length;
        state.total_length = total_length;
        state.files = files;
        state.piece_hashes = piece_hashes;
        state.raw_info = raw_info;
        drop(state);

        self.left.store(total_length, Ordering::Relaxed);
        self.ready.send_replace(true);
        Ok(())
    }

    /// Whether the description is complete and downloading may start.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// A watch that flips to true once the info dictionary is loaded.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn output_name(&self) -> String {
        self.state.lock().unwrap().output_name.clone()
    }

    pub fn piece_length(&self) -> u64 {
        self.state.lock().unwrap().piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.state.lock().unwrap().total_length
    }

    pub fn files(&self) -> Vec<FileEntry> {
        self.state.lock().unwrap().files.clone()
    }

    pub fn piece_count(&self) -> u64 {
        (self.state.lock().unwrap().piece_hashes.len() / 20) as u64
    }

    /// The expected SHA-1 of the given piece.
    pub fn piece_hash(&self, piece_index: u64) -> [u8; 20] {
        let state = self.state.lock().unwrap();
        let start = piece_index as usize * 20;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&state.piece_hashes[start..start + 20]);
        hash
    }

    /// Length in bytes of the given piece. Only the last piece may be
    /// shorter than `piece_length`.
    pub fn piece_size(&self, piece_index: u64) -> u64 {
        let state = self.state.lock().unwrap();
        let piece_count = (state.piece_hashes.len() / 20) as u64;
        if piece_index == piece_count - 1 {
            state.total_length - (piece_count - 1) * state.piece_length
        } else {
            state.piece_length
        }
    }

    /// The bencoded info dictionary, served to peers requesting metadata.
    pub fn raw_info(&self) -> Vec<u8> {
        self.state.lock().unwrap().raw_info.clone()
    }

    /// Size of the info dictionary for the extended handshake, if known.
    pub fn metadata_size(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        if state.raw_info.is_empty() {
            None
        } else {
            Some(state.raw_info.len() as u64)
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }

    pub fn pieces_done(&self) -> u64 {
        self.pieces_done.load(Ordering::Relaxed)
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account a newly completed piece: bumps `pieces_done` and shrinks
    /// `left` by the piece's length. Call once per piece.
    pub fn on_piece_complete(&self, piece_index: u64) {
        self.pieces_done.fetch_add(1, Ordering::Relaxed);
        let size = self.piece_size(piece_index);
        self.left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                Some(left.saturating_sub(size))
            })
            .ok();
    }

    /// Whether every piece has been completed.
    pub fn is_file_complete(&self) -> bool {
        self.is_ready()
            && self.pieces_done.load(Ordering::Relaxed) == self.piece_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let mut buf = b"d8:announce3:url4:infod6:lengthi12e4:name1:a12:piece \
                        lengthi12e6:pieces20:"
            .to_vec();
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let metainfo = Metainfo::from_bytes(&single_file_torrent()).unwrap();

        assert!(metainfo.is_ready());
        assert_eq!(metainfo.name(), "a");
        assert_eq!(metainfo.output_name(), "a.tmp");
        assert_eq!(metainfo.piece_length(), 12);
        assert_eq!(metainfo.total_length(), 12);
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.piece_size(0), 12);
        assert_eq!(metainfo.trackers, vec!["url".to_owned()]);
        assert_eq!(
            metainfo.files(),
            vec![FileEntry { length: 12, path: "a".to_owned() }]
        );
        assert_eq!(
            metainfo.info_hash.to_string(),
            "e7bcc8eaf3c8dd31d20977a66244d05e2cdd0e29"
        );
        assert_eq!(metainfo.left(), 12);
    }

    #[test]
    fn parses_multi_file_torrent_with_announce_list() {
        // two files of 3 and 5 bytes, piece length 4 -> 2 pieces
        let mut buf = b"d13:announce-listll6:udp://el7:http://ee4:infod\
                        5:filesld6:lengthi3e4:pathl1:b5:c.txteed6:lengthi5e\
                        4:pathl1:deee4:name3:dir12:piece lengthi4e6:pieces40:"
            .to_vec();
        buf.extend_from_slice(&[0u8; 40]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.trackers, vec!["udp://", "http://"]);
        assert_eq!(metainfo.name(), "dir");
        assert_eq!(metainfo.total_length(), 8);
        assert_eq!(metainfo.piece_count(), 2);
        // last piece is shorter
        assert_eq!(metainfo.piece_size(0), 4);
        assert_eq!(metainfo.piece_size(1), 4);
        assert_eq!(
            metainfo.files(),
            vec![
                FileEntry { length: 3, path: "b/c.txt".to_owned() },
                FileEntry { length: 5, path: "d".to_owned() },
            ]
        );
    }

    #[test]
    fn short_last_piece() {
        // 10 bytes with piece length 4 -> pieces of 4, 4 and 2
        let mut buf = b"d8:announce3:url4:infod6:lengthi10e4:name1:a\
                        12:piece lengthi4e6:pieces60:"
            .to_vec();
        buf.extend_from_slice(&[0u8; 60]);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.piece_count(), 3);
        assert_eq!(metainfo.piece_size(0), 4);
        assert_eq!(metainfo.piece_size(2), 2);
    }

    #[test]
    fn rejects_zero_length() {
        let buf = b"d8:announce3:url4:infod6:lengthi0e4:name1:a12:piece \
                    lengthi4e6:pieces0:ee"
            .to_vec();
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn rejects_mismatched_piece_hashes() {
        // 12 bytes at piece length 4 needs 3 hashes, only 1 given
        let mut buf = b"d8:announce3:url4:infod6:lengthi12e4:name1:a\
                        12:piece lengthi4e6:pieces20:"
            .to_vec();
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn counters_move_as_pieces_complete() {
        // 10 bytes, piece length 4 -> 3 pieces (4, 4, 2)
        let mut buf = b"d8:announce3:url4:infod6:lengthi10e4:name1:a\
                        12:piece lengthi4e6:pieces60:"
            .to_vec();
        buf.extend_from_slice(&[0u8; 60]);
        buf.extend_from_slice(b"ee");
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        assert_eq!(metainfo.left(), 10);
        assert!(!metainfo.is_file_complete());

        metainfo.on_piece_complete(0);
        assert_eq!(metainfo.left(), 6);

        metainfo.on_piece_complete(2);
        // the short last piece only subtracts its own length
        assert_eq!(metainfo.left(), 4);

        metainfo.on_piece_complete(1);
        assert_eq!(metainfo.left(), 0);
        assert!(metainfo.is_file_complete());
    }

    #[test]
    fn magnet_is_not_ready_until_info_loads() {
        let link = "magnet:?xt=urn:btih:e7bcc8eaf3c8dd31d20977a66244d05e2cdd0e29\
                    &dn=a&tr=udp%3A%2F%2Ftracker%3A6969";
        let metainfo = Metainfo::from_magnet(link).unwrap();
        assert!(!metainfo.is_ready());
        assert_eq!(metainfo.trackers, vec!["udp://tracker:6969".to_owned()]);

        // the info dictionary arrives from peers later
        let torrent = single_file_torrent();
        let root = Element::decode(&torrent).unwrap();
        let info = root.get(b"info").unwrap();
        metainfo.load_info(info, info.encode()).unwrap();

        assert!(metainfo.is_ready());
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.metadata_size(), Some(info.encode().len() as u64));
    }
}
