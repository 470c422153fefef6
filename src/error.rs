use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{disk::DiskMsg, peer::PeerManagerMsg, tracker::manager::TrackerManagerMsg};

#[derive(Error, Debug)]
pub enum Error {
    #[error("bencode parse error at byte {pos}: {reason}")]
    Bencode { pos: usize, reason: &'static str },

    #[error("the torrent file is missing the `{0}` key")]
    MetainfoMissingKey(&'static str),

    #[error("the torrent file is invalid: {0}")]
    MetainfoInvalid(&'static str),

    #[error("the magnet link could not be parsed")]
    MagnetLinkInvalid,

    #[error(
        "your magnet does not have an info_hash, are you sure you copied \
         the entire magnet link?"
    )]
    MagnetNoInfoHash,

    #[error("string is not UTF-8")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("could not open the file `{0}`")]
    FileOpenError(String),

    #[error("the announce url `{0}` has an unsupported scheme")]
    UnsupportedScheme(String),

    #[error("tracker resolved to no usable addresses")]
    TrackerNoHosts,

    #[error("could not connect to the UDP socket of the tracker")]
    TrackerSocketConnect,

    #[error("the response received from the tracker was invalid")]
    TrackerResponse,

    #[error("the response received from the tracker was too short")]
    TrackerResponseLength,

    #[error("the tracker did not answer any of the retransmits")]
    TrackerTimeout,

    #[error("the tracker rejected the request: {0}")]
    TrackerRejected(String),

    #[error("the peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("error while sending the announce request")]
    HttpError(#[from] reqwest::Error),

    #[error("the handshake received is not valid")]
    HandshakeInvalid,

    #[error("the peer closed the socket")]
    PeerClosedSocket,

    #[error("received a message with an unknown id {0}")]
    MessageId(u8),

    #[error("received a message of {0} bytes, which is above the limit")]
    MessageTooLarge(usize),

    #[error("the response received from the peer is wrong")]
    MessageResponse,

    #[error("the client was stopped before the download completed")]
    Stopped,

    #[error("error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("error while trying to load configuration: {0}")]
    FromConfigError(#[from] config::ConfigError),

    #[error("could not send message to Disk")]
    SendErrorDisk(#[from] mpsc::error::SendError<DiskMsg>),

    #[error("could not send message to the peer manager")]
    SendErrorPeerManager(#[from] mpsc::error::SendError<PeerManagerMsg>),

    #[error("could not send message to the tracker manager")]
    SendErrorTrackerManager(#[from] mpsc::error::SendError<TrackerManagerMsg>),

    #[error("could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}
