//! The client façade that wires metainfo, piece store, trackers and peers
//! together.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use tokio::{
    spawn,
    sync::{mpsc, watch},
};
use tracing::{error, info};

use crate::{
    bitfield::PieceMap,
    config::CONFIG,
    counter::RateEstimator,
    disk::{Disk, DiskMsg},
    error::Error,
    metainfo::Metainfo,
    peer::{PeerId, PeerManager, PeerManagerMsg},
    tracker::manager::{TrackerManager, TrackerManagerMsg},
    utils::to_human_readable,
};

/// A running torrent download.
///
/// `start` wires everything and returns immediately; `wait` blocks until
/// the torrent is downloaded, verified and extracted; `stop` tears the
/// subsystems down.
pub struct Client {
    pub metainfo: Arc<Metainfo>,
    disk_tx: mpsc::Sender<DiskMsg>,
    tracker_tx: mpsc::Sender<TrackerManagerMsg>,
    peer_manager_tx: mpsc::Sender<PeerManagerMsg>,
    ready_rx: watch::Receiver<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Client {
    /// Start downloading `source`, a path to a .torrent file or a magnet
    /// link.
    pub async fn start(source: &str) -> Result<Client, Error> {
        let metainfo = Arc::new(Metainfo::new(source).await?);
        let peer_id = PeerId::generate();
        info!("starting {} with peer id {peer_id}", metainfo.info_hash);

        let pieces = Arc::new(PieceMap::new());

        let (disk_tx, disk_rx) = mpsc::channel::<DiskMsg>(512);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel::<()>();
        let (done_tx, done_rx) = watch::channel(false);
        let (peers_tx, peers_rx) = mpsc::channel::<SocketAddr>(256);
        let (peer_manager_tx, peer_manager_rx) =
            mpsc::channel::<PeerManagerMsg>(512);
        let (tracker_tx, tracker_rx) = mpsc::channel::<TrackerManagerMsg>(64);

        // every completed piece updates the counters, may wake the piece
        // store's completion check and is broadcast to the other peers. The
        // store only borrows the metainfo here, upgraded per call.
        {
            let metainfo = Arc::downgrade(&metainfo);
            let peer_manager_tx = peer_manager_tx.clone();
            pieces.set_on_piece_complete(Box::new(move |piece| {
                if let Some(metainfo) = metainfo.upgrade() {
                    metainfo.on_piece_complete(piece);
                    if metainfo.is_file_complete() {
                        let _ = completion_tx.send(());
                    }
                }
                let _ =
                    peer_manager_tx.try_send(PeerManagerMsg::HavePiece(piece));
            }));
        }

        // trackers feed discovered endpoints into the peer manager
        let mut tracker_manager = TrackerManager::new(
            metainfo.clone(),
            peer_id.clone(),
            tracker_tx.clone(),
            tracker_rx,
            peers_tx,
        );
        spawn(async move {
            if let Err(e) = tracker_manager.run().await {
                error!("tracker manager failed: {e}");
            }
        });
        for url in &metainfo.trackers {
            tracker_tx.send(TrackerManagerMsg::Add(url.clone())).await?;
        }

        let mut peer_manager = PeerManager::new(
            metainfo.clone(),
            pieces.clone(),
            disk_tx.clone(),
            peer_manager_tx.clone(),
            peer_manager_rx,
            peers_rx,
            peer_id,
        );
        spawn(async move {
            if let Err(e) = peer_manager.run().await {
                error!("peer manager failed: {e}");
            }
        });

        // the piece store comes up once the description is ready: right
        // away for .torrent files, after the metadata exchange for magnets
        let ready_rx = metainfo.subscribe_ready();
        {
            let metainfo = metainfo.clone();
            let pieces = pieces.clone();
            spawn(async move {
                let mut ready = metainfo.subscribe_ready();
                if ready.wait_for(|ready| *ready).await.is_err() {
                    return;
                }
                pieces.init(metainfo.piece_count());

                let mut disk = Disk::new(
                    metainfo,
                    pieces,
                    disk_rx,
                    completion_rx,
                    done_tx,
                    PathBuf::from(&CONFIG.download_dir),
                );
                if let Err(e) = disk.run().await {
                    error!("piece store failed: {e}");
                }
            });
        }

        // progress log while the download runs
        {
            let metainfo = metainfo.clone();
            let mut done = done_rx.clone();
            spawn(async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(5));
                let mut download = RateEstimator::new();
                let mut upload = RateEstimator::new();
                loop {
                    interval.tick().await;
                    // the store finished or the client was stopped
                    if *done.borrow_and_update() || done.has_changed().is_err()
                    {
                        return;
                    }
                    if !metainfo.is_ready() {
                        continue;
                    }
                    download.update(metainfo.downloaded());
                    upload.update(metainfo.uploaded());
                    info!(
                        "{} of {}, down {}/s, up {}/s",
                        to_human_readable(
                            (metainfo.total_length() - metainfo.left()) as f64
                        ),
                        to_human_readable(metainfo.total_length() as f64),
                        to_human_readable(download.rate() as f64),
                        to_human_readable(upload.rate() as f64),
                    );
                }
            });
        }

        Ok(Client {
            metainfo,
            disk_tx,
            tracker_tx,
            peer_manager_tx,
            ready_rx,
            done_rx,
        })
    }

    /// Block until the torrent is ready, fully downloaded and extracted.
    pub async fn wait(&mut self) -> Result<(), Error> {
        self.ready_rx
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::Stopped)?;
        self.done_rx
            .wait_for(|done| *done)
            .await
            .map_err(|_| Error::Stopped)?;
        Ok(())
    }

    /// Cascade a shutdown to trackers, peers and the piece store.
    pub async fn stop(&self) {
        let _ = self.tracker_tx.send(TrackerManagerMsg::Stop).await;
        let _ = self.peer_manager_tx.send(PeerManagerMsg::Quit).await;
        let _ = self.disk_tx.send(DiskMsg::Quit).await;
    }
}
