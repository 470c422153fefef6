//! Supervision of every peer session of the torrent.

use std::{net::SocketAddr, sync::Arc};

use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    select, spawn,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::PieceMap,
    config::CONFIG,
    disk::DiskMsg,
    error::Error,
    metainfo::Metainfo,
    tcp_wire::Handshake,
};

use super::{Peer, PeerId, PeerMsg, SwarmCtx};

#[derive(Debug)]
pub enum PeerManagerMsg {
    /// A session finished its handshake exchange.
    Handshaked(SocketAddr),
    /// A session ended, successfully or not.
    Closed(SocketAddr),
    /// We completed a piece, fan a Have out to every session.
    HavePiece(u64),
    /// Tear every session down and stop.
    Quit,
}

struct PeerHandle {
    tx: mpsc::Sender<PeerMsg>,
    handshook: bool,
}

/// Owns every peer session: deduplicates endpoints, initiates outbound
/// connections for endpoints the trackers discovered, accepts inbound
/// connections on the configured port and keeps the sessions' lifecycle
/// book.
pub struct PeerManager {
    metainfo: Arc<Metainfo>,
    pieces: Arc<PieceMap>,
    disk_tx: mpsc::Sender<DiskMsg>,
    tx: mpsc::Sender<PeerManagerMsg>,
    rx: mpsc::Receiver<PeerManagerMsg>,
    /// Endpoints discovered by the tracker sessions.
    discovered_rx: mpsc::Receiver<SocketAddr>,
    /// The handshake every session sends, computed once.
    handshake: Handshake,
    peers: HashMap<SocketAddr, PeerHandle>,
    active_peers: usize,
}

impl PeerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metainfo: Arc<Metainfo>,
        pieces: Arc<PieceMap>,
        disk_tx: mpsc::Sender<DiskMsg>,
        tx: mpsc::Sender<PeerManagerMsg>,
        rx: mpsc::Receiver<PeerManagerMsg>,
        discovered_rx: mpsc::Receiver<SocketAddr>,
        peer_id: PeerId,
    ) -> Self {
        let handshake = Handshake::new(metainfo.info_hash.clone(), peer_id);
        Self {
            metainfo,
            pieces,
            disk_tx,
            tx,
            rx,
            discovered_rx,
            handshake,
            peers: HashMap::new(),
            active_peers: 0,
        }
    }

    fn swarm_ctx(&self) -> SwarmCtx {
        SwarmCtx {
            metainfo: self.metainfo.clone(),
            pieces: self.pieces.clone(),
            disk_tx: self.disk_tx.clone(),
            manager_tx: self.tx.clone(),
            handshake: self.handshake.clone(),
        }
    }

    #[tracing::instrument(skip(self), name = "peer_manager")]
    pub async fn run(&mut self) -> Result<(), Error> {
        let listener =
            TcpListener::bind(("0.0.0.0", CONFIG.port)).await?;
        info!("listening for peers on port {}", CONFIG.port);

        loop {
            select! {
                accepted = listener.accept() => {
                    if let Ok((stream, addr)) = accepted {
                        self.accept(stream, addr);
                    }
                }
                Some(addr) = self.discovered_rx.recv() => self.add(addr),
                Some(msg) = self.rx.recv() => match msg {
                    PeerManagerMsg::Handshaked(addr) => {
                        if let Some(peer) = self.peers.get_mut(&addr) {
                            peer.handshook = true;
                            self.active_peers += 1;
                            info!(
                                "active peers: {}, handshake complete with \
                                 {addr}",
                                self.active_peers
                            );
                        }
                    }
                    PeerManagerMsg::Closed(addr) => {
                        if let Some(peer) = self.peers.remove(&addr) {
                            if peer.handshook {
                                self.active_peers -= 1;
                            }
                            info!(
                                "active peers: {}, connection lost with \
                                 {addr}",
                                self.active_peers
                            );
                        }
                    }
                    PeerManagerMsg::HavePiece(piece) => {
                        for peer in self.peers.values() {
                            if peer.tx.try_send(PeerMsg::HavePiece(piece))
                                .is_err()
                            {
                                debug!("could not notify a peer of {piece}");
                            }
                        }
                    }
                    PeerManagerMsg::Quit => {
                        debug!("stopping {} peers", self.peers.len());
                        for (_, peer) in self.peers.drain() {
                            let _ = peer.tx.try_send(PeerMsg::Quit);
                        }
                        return Ok(());
                    }
                },
                else => return Ok(()),
            }
        }
    }

    fn at_capacity(&self) -> bool {
        self.peers.len() >= CONFIG.max_peers as usize
    }

    /// Start an outbound session unless the endpoint is already known.
    fn add(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr) {
            return;
        }
        if self.at_capacity() {
            debug!("peer limit reached, not connecting to {addr}");
            return;
        }

        let (tx, rx) = mpsc::channel(100);
        self.peers.insert(addr, PeerHandle { tx, handshook: false });

        let ctx = self.swarm_ctx();
        spawn(async move {
            if let Err(e) = Peer::start_outbound(ctx.clone(), addr, rx).await {
                debug!("peer {addr} ended: {e}");
            }
            let _ = ctx.manager_tx.send(PeerManagerMsg::Closed(addr)).await;
        });
    }

    /// Adopt a peer that connected to our listener.
    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.peers.contains_key(&addr) {
            warn!("duplicate connection from {addr}, dropping it");
            return;
        }
        if self.at_capacity() {
            debug!("peer limit reached, rejecting {addr}");
            return;
        }

        debug!("incoming connection from {addr}");
        let (tx, rx) = mpsc::channel(100);
        self.peers.insert(addr, PeerHandle { tx, handshook: false });

        let ctx = self.swarm_ctx();
        spawn(async move {
            if let Err(e) = Peer::start_inbound(ctx.clone(), stream, rx).await {
                debug!("peer {addr} ended: {e}");
            }
            let _ = ctx.manager_tx.send(PeerManagerMsg::Closed(addr)).await;
        });
    }
}
