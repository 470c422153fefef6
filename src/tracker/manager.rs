//! Lifetime of the tracker sessions of a torrent.

use std::{net::SocketAddr, sync::Arc};

use hashbrown::HashMap;
use tokio::{spawn, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{error::Error, metainfo::Metainfo, peer::PeerId};

use super::{Http, Tracker, TrackerMsg, Udp};

#[derive(Debug)]
pub enum TrackerManagerMsg {
    /// Start a session for the given announce url, unless one exists.
    Add(String),
    /// Tear the session with the given announce url down.
    Remove(String),
    /// A session ended on its own, usually a network error. The tracker is
    /// forgotten; re-adding the url starts a fresh session.
    Disconnected(String),
    /// Announce a goodbye to every tracker and stop.
    Stop,
}

struct TrackerHandle {
    tx: mpsc::Sender<TrackerMsg>,
    task: JoinHandle<()>,
}

/// Maps announce urls to running tracker sessions and fans discovered peer
/// endpoints out to the peer manager through the shared channel.
pub struct TrackerManager {
    metainfo: Arc<Metainfo>,
    peer_id: PeerId,
    tx: mpsc::Sender<TrackerManagerMsg>,
    rx: mpsc::Receiver<TrackerManagerMsg>,
    /// Endpoint sink handed to every session, the peer manager's inbox.
    peers_tx: mpsc::Sender<SocketAddr>,
    trackers: HashMap<String, TrackerHandle>,
}

impl TrackerManager {
    pub fn new(
        metainfo: Arc<Metainfo>,
        peer_id: PeerId,
        tx: mpsc::Sender<TrackerManagerMsg>,
        rx: mpsc::Receiver<TrackerManagerMsg>,
        peers_tx: mpsc::Sender<SocketAddr>,
    ) -> Self {
        Self {
            metainfo,
            peer_id,
            tx,
            rx,
            peers_tx,
            trackers: HashMap::new(),
        }
    }

    #[tracing::instrument(skip(self), name = "tracker_manager")]
    pub async fn run(&mut self) -> Result<(), Error> {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                TrackerManagerMsg::Add(url) => self.add(url),
                TrackerManagerMsg::Remove(url)
                | TrackerManagerMsg::Disconnected(url) => {
                    if let Some(tracker) = self.trackers.remove(&url) {
                        tracker.task.abort();
                        info!(
                            "tracker count: {}, connection lost with {url}",
                            self.trackers.len()
                        );
                    }
                }
                TrackerManagerMsg::Stop => {
                    debug!("stopping {} trackers", self.trackers.len());
                    for (_, tracker) in self.trackers.drain() {
                        // the goodbye announce runs in the session task
                        let _ =
                            tracker.tx.try_send(TrackerMsg::Shutdown);
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Spawn the session matching the url's scheme.
    fn add(&mut self, url: String) {
        if self.trackers.contains_key(&url) {
            return;
        }

        let metainfo = self.metainfo.clone();
        let peer_id = self.peer_id.clone();
        let peers_tx = self.peers_tx.clone();
        let manager_tx = self.tx.clone();
        let (tx, rx) = mpsc::channel::<TrackerMsg>(8);

        let task = if url.starts_with("udp://") {
            let url_clone = url.clone();
            spawn(async move {
                let session = Tracker::<Udp>::connect(
                    url_clone.clone(),
                    metainfo,
                    peer_id,
                    peers_tx,
                    rx,
                )
                .await;
                match session {
                    Ok(session) => {
                        if let Err(e) = session.run().await {
                            warn!("tracker {url_clone} failed: {e}");
                        }
                    }
                    Err(e) => warn!("could not reach tracker {url_clone}: {e}"),
                }
                let _ = manager_tx
                    .send(TrackerManagerMsg::Disconnected(url_clone))
                    .await;
            })
        } else if url.starts_with("http://") || url.starts_with("https://") {
            let url_clone = url.clone();
            spawn(async move {
                let session = Tracker::<Http>::new(
                    url_clone.clone(),
                    metainfo,
                    peer_id,
                    peers_tx,
                    rx,
                );
                if let Err(e) = session.run().await {
                    warn!("tracker {url_clone} failed: {e}");
                }
                let _ = manager_tx
                    .send(TrackerManagerMsg::Disconnected(url_clone))
                    .await;
            })
        } else {
            warn!("ignoring tracker with unsupported scheme: {url}");
            return;
        };

        info!("new tracker: {url}");
        self.trackers.insert(url, TrackerHandle { tx, task });
    }
}
