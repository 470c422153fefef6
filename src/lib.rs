//! A library implementing the core of a BitTorrent V1 client.
//!
//! Given a .torrent file or a magnet link, the [`client::Client`] resolves
//! the torrent's trackers, discovers peers, downloads pieces from many peers
//! concurrently over the peer wire protocol, verifies every piece against
//! its SHA-1 hash and assembles the output files on disk.
//!
//! The building blocks are usable on their own:
//!
//! * [`bencode`] - the bencoding value tree and codec.
//! * [`metainfo`] - the parsed torrent description and live counters.
//! * [`tracker`] - HTTP, HTTPS and UDP (BEP-15) announce sessions.
//! * [`peer`] - per-peer wire protocol state machines.
//! * [`disk`] - hash-verified piece storage and extraction.

pub mod bencode;
pub mod bitfield;
pub mod client;
pub mod config;
pub mod counter;
pub mod disk;
pub mod error;
pub mod extension;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod tcp_wire;
pub mod tracker;
pub mod utils;
