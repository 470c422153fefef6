//! Tracker sessions: announce the torrent's progress and feed discovered
//! peer endpoints into the swarm.
//!
//! Three announce protocols are supported behind one session type, generic
//! over its transport: `udp://` trackers speak the binary BEP 15 protocol,
//! `http://` and `https://` trackers share the GET based announce where the
//! transport differences end at the HTTP client.

pub mod action;
pub mod announce;
pub mod connect;
pub mod event;
pub mod http;
pub mod manager;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::UdpSocket,
    select,
    sync::mpsc,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::CONFIG, error::Error, metainfo::Metainfo, peer::PeerId,
};

use self::{action::Action, event::Event};

/// A connection id may be used for one minute after the tracker handed it
/// out, per BEP 15.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

static ANNOUNCE_RES_BUF_LEN: usize = 8192;

pub trait Protocol {}

pub struct Udp {
    socket: UdpSocket,
    connection_id: Option<(u64, Instant)>,
}

pub struct Http {
    client: reqwest::Client,
}

impl Protocol for Udp {}
impl Protocol for Http {}

/// Control messages sent into a running tracker session.
#[derive(Debug)]
pub enum TrackerMsg {
    /// Announce a goodbye to the tracker and end the session.
    Shutdown,
}

/// A session with a single tracker. The generic `P` is the transport.
pub struct Tracker<P: Protocol> {
    pub announce_url: String,
    metainfo: Arc<Metainfo>,
    peer_id: PeerId,
    /// Discovered endpoints are fanned out through here.
    peers_tx: mpsc::Sender<SocketAddr>,
    rx: mpsc::Receiver<TrackerMsg>,
    state: P,
}

impl Tracker<Udp> {
    /// Resolve the announce url and bind a socket towards the tracker.
    pub async fn connect(
        announce_url: String,
        metainfo: Arc<Metainfo>,
        peer_id: PeerId,
        peers_tx: mpsc::Sender<SocketAddr>,
        rx: mpsc::Receiver<TrackerMsg>,
    ) -> Result<Self, Error> {
        let addr = udp_addr_of(&announce_url)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(&addr)
            .await
            .map_err(|_| Error::TrackerSocketConnect)?;

        debug!("bound udp tracker socket towards {addr}");

        Ok(Self {
            announce_url,
            metainfo,
            peer_id,
            peers_tx,
            rx,
            state: Udp { socket, connection_id: None },
        })
    }

    /// Send a request and wait for the reply, retransmitting on the BEP 15
    /// schedule: 15 * 2^n seconds, n capped at 8.
    async fn exchange(
        &self,
        packet: &[u8],
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        for n in 0..=8u32 {
            self.state.socket.send(packet).await?;

            let retransmit = Duration::from_secs(15 * 2u64.pow(n));
            match timeout(retransmit, self.state.socket.recv(buf)).await {
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!(
                        "tracker request was lost, retransmitting after \
                         {retransmit:?}"
                    );
                }
            }
        }
        Err(Error::TrackerTimeout)
    }

    /// Surface a tracker error packet as an error, if that is what arrived.
    fn check_error_packet(
        buf: &[u8],
        transaction_id: u32,
    ) -> Result<(), Error> {
        if buf.len() < 8 {
            return Err(Error::TrackerResponseLength);
        }
        let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let tid = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if action == Action::Error as u32 && tid == transaction_id {
            let reason = String::from_utf8_lossy(&buf[8..]).into_owned();
            return Err(Error::TrackerRejected(reason));
        }
        Ok(())
    }

    /// The connection id of this session, running the connect exchange if
    /// there is none yet or the previous one expired.
    async fn obtain_connection_id(&mut self) -> Result<u64, Error> {
        if let Some((id, obtained_at)) = self.state.connection_id {
            if obtained_at.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
            // expired, fall back to the connect exchange
            self.state.connection_id = None;
        }

        let req = connect::Request::new();
        let mut buf = [0u8; 512];
        let len = self.exchange(&req.serialize(), &mut buf).await?;

        Self::check_error_packet(&buf[..len], req.transaction_id)?;
        let res = connect::Response::deserialize(&buf[..len])?;

        if res.transaction_id != req.transaction_id
            || res.action != Action::Connect as u32
        {
            warn!("tracker connect response is not valid, dropping it");
            return Err(Error::TrackerResponse);
        }

        debug!("obtained connection id {}", res.connection_id);
        self.state.connection_id = Some((res.connection_id, Instant::now()));
        Ok(res.connection_id)
    }

    /// Announce the current counters and collect the compact peer list of
    /// the response.
    pub async fn announce(
        &mut self,
        event: Event,
    ) -> Result<(announce::Response, Vec<SocketAddr>), Error> {
        let connection_id = self.obtain_connection_id().await?;

        let req = announce::Request {
            downloaded: self.metainfo.downloaded(),
            left: self.metainfo.left(),
            uploaded: self.metainfo.uploaded(),
            ..announce::Request::new(
                connection_id,
                self.metainfo.info_hash.clone(),
                self.peer_id.clone(),
                CONFIG.port,
                event,
            )
        };

        let mut buf = vec![0u8; ANNOUNCE_RES_BUF_LEN];
        let len = self.exchange(&req.serialize(), &mut buf).await?;

        Self::check_error_packet(&buf[..len], req.transaction_id)?;
        let (res, payload) = announce::Response::deserialize(&buf[..len])?;

        if res.transaction_id != req.transaction_id
            || res.action != Action::Announce as u32
        {
            warn!("tracker announce response is not valid, dropping it");
            return Err(Error::TrackerResponse);
        }

        let peers = parse_compact_peer_list(payload)?;
        Ok((res, peers))
    }

    /// Announce on the tracker's interval until an exchange fails for good
    /// or a shutdown is requested.
    #[tracing::instrument(skip(self), fields(url = %self.announce_url))]
    pub async fn run(mut self) -> Result<(), Error> {
        let mut event = Event::Started;
        loop {
            let (res, peers) = self.announce(event).await?;
            event = Event::None;

            info!(
                "fetched {} peers, next announce in {}s",
                peers.len(),
                res.interval
            );
            for peer in peers {
                let _ = self.peers_tx.send(peer).await;
            }

            select! {
                _ = sleep(Duration::from_secs(res.interval.max(1) as u64)) => {}
                Some(TrackerMsg::Shutdown) = self.rx.recv() => {
                    debug!("saying goodbye to the tracker");
                    let _ = self.announce(Event::Stopped).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Decode a compact peer list: 6 bytes per peer, 4 IPv4 bytes followed by a
/// big-endian port.
pub fn parse_compact_peer_list(buf: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::TrackerCompactPeerList);
    }

    let mut peers = Vec::with_capacity(buf.len() / 6);
    for chunk in chunks {
        let ip = IpAddr::from(Ipv4Addr::new(
            chunk[0], chunk[1], chunk[2], chunk[3],
        ));
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        peers.push((ip, port).into());
    }
    Ok(peers)
}

/// The host:port part of a `udp://` announce url.
fn udp_addr_of(announce_url: &str) -> Result<String, Error> {
    let rest = announce_url
        .strip_prefix("udp://")
        .ok_or_else(|| Error::UnsupportedScheme(announce_url.to_owned()))?;
    let host_port = match rest.find('/') {
        Some(i) => &rest[..i],
        None => rest,
    };
    if host_port.is_empty() {
        return Err(Error::TrackerNoHosts);
    }
    Ok(host_port.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metainfo() -> Arc<Metainfo> {
        let mut buf = b"d8:announce3:url4:infod6:lengthi12e4:name1:a\
                        12:piece lengthi12e6:pieces20:"
            .to_vec();
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        Arc::new(Metainfo::from_bytes(&buf).unwrap())
    }

    #[test]
    fn compact_peer_list() {
        let peers =
            parse_compact_peer_list(&[127, 0, 0, 1, 0x1f, 0x90]).unwrap();
        assert_eq!(peers, vec!["127.0.0.1:8080".parse().unwrap()]);

        let peers = parse_compact_peer_list(&[]).unwrap();
        assert!(peers.is_empty());

        // a truncated list is invalid
        assert!(parse_compact_peer_list(&[127, 0, 0, 1, 0x1f]).is_err());
    }

    #[test]
    fn error_packets_surface_their_reason() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());
        buf.extend_from_slice(b"torrent not registered");

        assert!(matches!(
            Tracker::<Udp>::check_error_packet(&buf, 42),
            Err(Error::TrackerRejected(reason))
                if reason == "torrent not registered"
        ));

        // a mismatched transaction id is not our error packet
        assert!(Tracker::<Udp>::check_error_packet(&buf, 43).is_ok());

        // too short to carry an action at all
        assert!(Tracker::<Udp>::check_error_packet(&buf[..6], 42).is_err());
    }

    #[test]
    fn udp_announce_url_parsing() {
        assert_eq!(
            udp_addr_of("udp://tracker.example.com:6969/announce").unwrap(),
            "tracker.example.com:6969"
        );
        assert_eq!(
            udp_addr_of("udp://tracker.example.com:6969").unwrap(),
            "tracker.example.com:6969"
        );
        assert!(udp_addr_of("http://tracker.example.com").is_err());
    }

    #[tokio::test]
    async fn connect_and_announce_against_mock_tracker() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let mut buf = [0u8; 1024];

            // connect request
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, connect::Request::LENGTH);
            assert_eq!(&buf[..8], &0x41727101980u64.to_be_bytes());
            assert_eq!(&buf[8..12], &0u32.to_be_bytes());
            let tid = buf[12..16].to_vec();

            let mut res = Vec::new();
            res.extend_from_slice(&0u32.to_be_bytes());
            res.extend_from_slice(&tid);
            res.extend_from_slice(&0xDEADBEEFu64.to_be_bytes());
            server.send_to(&res, from).await.unwrap();

            // announce request
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, announce::Request::LENGTH);
            assert_eq!(&buf[..8], &0xDEADBEEFu64.to_be_bytes());
            assert_eq!(&buf[8..12], &1u32.to_be_bytes());
            let tid = buf[12..16].to_vec();

            let mut res = Vec::new();
            res.extend_from_slice(&1u32.to_be_bytes());
            res.extend_from_slice(&tid);
            res.extend_from_slice(&1800u32.to_be_bytes());
            res.extend_from_slice(&0u32.to_be_bytes());
            res.extend_from_slice(&1u32.to_be_bytes());
            res.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);
            server.send_to(&res, from).await.unwrap();
        });

        let (peers_tx, _peers_rx) = mpsc::channel(10);
        let (_msg_tx, msg_rx) = mpsc::channel(10);
        let mut tracker = Tracker::<Udp>::connect(
            format!("udp://{server_addr}/announce"),
            test_metainfo(),
            PeerId::generate(),
            peers_tx,
            msg_rx,
        )
        .await
        .unwrap();

        let (res, peers) = tracker.announce(Event::Started).await.unwrap();

        assert_eq!(res.interval, 1800);
        assert_eq!(res.seeders, 1);
        assert_eq!(peers, vec!["10.0.0.1:6881".parse().unwrap()]);

        // the connection id was cached for the next announce
        let (id, _) = tracker.state.connection_id.unwrap();
        assert_eq!(id, 0xDEADBEEF);

        server_task.await.unwrap();
    }
}
