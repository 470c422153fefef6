//! HTTP and HTTPS tracker announces.
//!
//! Both schemes share this code path, the HTTP client takes care of TLS and
//! SNI for `https://` urls. The announce is a GET whose query carries the
//! raw info hash and peer id percent-encoded, the response is a bencoded
//! dictionary with the re-announce interval and a compact peer list.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{select, sync::mpsc, time::sleep};
use tracing::{debug, info};

use crate::{
    bencode::Element, config::CONFIG, error::Error, metainfo::Metainfo,
    peer::PeerId,
};

use super::{event::Event, parse_compact_peer_list, Http, Tracker, TrackerMsg};

impl Tracker<Http> {
    pub fn new(
        announce_url: String,
        metainfo: Arc<Metainfo>,
        peer_id: PeerId,
        peers_tx: mpsc::Sender<SocketAddr>,
        rx: mpsc::Receiver<TrackerMsg>,
    ) -> Self {
        Self {
            announce_url,
            metainfo,
            peer_id,
            peers_tx,
            rx,
            state: Http { client: reqwest::Client::new() },
        }
    }

    /// The full announce url with the query parameters appended.
    fn announce_url(&self, event: Event) -> String {
        // announce urls may already carry a query (passkeys)
        let separator =
            if self.announce_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}\
             &left={}&compact=1",
            self.announce_url,
            separator,
            urlencoding::encode_binary(&self.metainfo.info_hash.0),
            urlencoding::encode_binary(&self.peer_id.0),
            CONFIG.port,
            self.metainfo.uploaded(),
            self.metainfo.downloaded(),
            self.metainfo.left(),
        );
        if let Some(event) = event.query_value() {
            url.push_str(&format!("&event={event}"));
        }
        url
    }

    /// Announce the current counters, returning the re-announce interval in
    /// seconds and the peer endpoints of the response.
    pub async fn announce(
        &self,
        event: Event,
    ) -> Result<(u32, Vec<SocketAddr>), Error> {
        let url = self.announce_url(event);
        debug!("announcing to {url}");

        let response = self
            .state
            .client
            .get(&url)
            .header(reqwest::header::CONNECTION, "close")
            .header(reqwest::header::ACCEPT, "*/*")
            .send()
            .await?
            .bytes()
            .await?;

        decode_announce_response(&response)
    }

    /// Announce on the tracker's interval until a request fails for good or
    /// a shutdown is requested.
    #[tracing::instrument(skip(self), fields(url = %self.announce_url))]
    pub async fn run(mut self) -> Result<(), Error> {
        let mut event = Event::Started;
        loop {
            let (interval, peers) = self.announce(event).await?;
            event = Event::None;

            info!(
                "fetched {} peers, next announce in {interval}s",
                peers.len()
            );
            for peer in peers {
                let _ = self.peers_tx.send(peer).await;
            }

            select! {
                _ = sleep(Duration::from_secs(interval as u64)) => {}
                Some(TrackerMsg::Shutdown) = self.rx.recv() => {
                    debug!("saying goodbye to the tracker");
                    let _ = self.announce(Event::Stopped).await;
                    return Ok(());
                }
            }
        }
    }
}

/// Decode a bencoded announce response into the re-announce interval and
/// the peer endpoints. The peer list comes either in the compact form or as
/// the original list of dictionaries.
fn decode_announce_response(
    body: &[u8],
) -> Result<(u32, Vec<SocketAddr>), Error> {
    let root = Element::decode(body)?;

    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason.as_str().unwrap_or("unknown").to_owned();
        return Err(Error::TrackerRejected(reason));
    }

    let interval = root
        .get(b"interval")
        .and_then(Element::as_integer)
        .filter(|interval| *interval > 0)
        .ok_or(Error::TrackerResponse)? as u32;

    let peers = match root.get(b"peers") {
        Some(Element::ByteString(bytes)) => parse_compact_peer_list(bytes)?,
        Some(Element::List(list)) => list
            .iter()
            .filter_map(|peer| {
                let ip = peer.get(b"ip")?.as_str()?.parse().ok()?;
                let port = peer.get(b"port")?.as_integer()?;
                Some(SocketAddr::new(ip, port as u16))
            })
            .collect(),
        _ => return Err(Error::TrackerResponse),
    };

    Ok((interval, peers))
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
    fn announce_url_carries_the_query() {
        let (peers_tx, _) = mpsc::channel(1);
        let (_msg_tx, msg_rx) = mpsc::channel(1);
        let tracker = Tracker::<Http>::new(
            "http://tracker.example.com/announce".to_owned(),
            test_metainfo(),
            PeerId([b'A'; 20]),
            peers_tx,
            msg_rx,
        );

        let url = tracker.announce_url(Event::None);
        assert!(url.starts_with("http://tracker.example.com/announce?"));
        assert!(url.contains(
            "info_hash=%E7%BC%C8%EA%F3%C8%DD1%D2%09w%A6bD%D0%5E%2C%DD%0E%29"
        ));
        assert!(url.contains("peer_id=AAAAAAAAAAAAAAAAAAAA"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&left=12"));
        // periodic announces carry no event
        assert!(!url.contains("&event="));

        let url = tracker.announce_url(Event::Started);
        assert!(url.ends_with("&event=started"));

        let url = tracker.announce_url(Event::Stopped);
        assert!(url.ends_with("&event=stopped"));
    }

    #[test]
    fn announce_url_respects_existing_query() {
        let (peers_tx, _) = mpsc::channel(1);
        let (_msg_tx, msg_rx) = mpsc::channel(1);
        let tracker = Tracker::<Http>::new(
            "http://tracker.example.com/announce?passkey=s3cret".to_owned(),
            test_metainfo(),
            PeerId([b'A'; 20]),
            peers_tx,
            msg_rx,
        );

        let url = tracker.announce_url(Event::None);
        assert!(url
            .starts_with("http://tracker.example.com/announce?passkey=s3cret&"));
    }

    #[test]
    fn decodes_a_compact_response() {
        let mut body = b"d8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1f, 0x90]);
        body.push(b'e');

        let (interval, peers) = decode_announce_response(&body).unwrap();
        assert_eq!(interval, 1800);
        assert_eq!(peers, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn decodes_a_dictionary_response() {
        let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.9\
                     4:porti6881eeee";

        let (interval, peers) = decode_announce_response(body).unwrap();
        assert_eq!(interval, 900);
        assert_eq!(peers, vec!["10.0.0.9:6881".parse().unwrap()]);
    }

    #[test]
    fn zero_peers_with_an_interval_is_fine() {
        let body = b"d8:intervali1800e5:peers0:e";
        let (interval, peers) = decode_announce_response(body).unwrap();
        assert_eq!(interval, 1800);
        assert!(peers.is_empty());
    }

    #[test]
    fn surfaces_the_failure_reason() {
        let body = b"d14:failure reason11:unknown keye";
        assert!(matches!(
            decode_announce_response(body),
            Err(Error::TrackerRejected(reason)) if reason == "unknown key"
        ));
    }

    #[test]
    fn missing_keys_are_an_error() {
        assert!(decode_announce_response(b"d5:peers0:e").is_err());
        assert!(decode_announce_response(b"d8:intervali1800ee").is_err());
    }
}
