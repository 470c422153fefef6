//! A remote peer in the swarm that we download from and upload to.
//!
//! Each peer runs as its own task: it performs the 68-byte handshake,
//! switches the connection to the framed message codec and then drives the
//! wire protocol state machine. Pieces are pulled from the shared
//! [`PieceMap`]: a session asks for an assignment, pipelines batches of
//! block requests, streams the arriving blocks into the piece store and
//! reports the verified piece back. A session that dies with a piece in
//! flight releases it so another peer can pick it up.

pub mod manager;
mod types;

// re-exports
pub use manager::{PeerManager, PeerManagerMsg};
pub use types::*;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use hashbrown::HashSet;
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
    time::{interval, interval_at, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, info, warn};

use crate::{
    bencode::Element,
    bitfield::{Bitfield, PieceMap},
    config::CONFIG,
    disk::{DiskMsg, WriteStatus},
    error::Error,
    extension::{
        self, ExtendedHandshake, Metadata, MetadataBuffer, UT_METADATA_ID,
    },
    metainfo::{InfoHash, Metainfo},
    tcp_wire::{
        Block, BlockInfo, ExtendedMessage, Handshake, HandshakeCodec, Message,
        MessageCodec,
    },
};

type PeerStream = Framed<TcpStream, MessageCodec>;

/// Everything a peer session needs from the rest of the client.
#[derive(Clone)]
pub struct SwarmCtx {
    pub metainfo: Arc<Metainfo>,
    pub pieces: Arc<PieceMap>,
    pub disk_tx: mpsc::Sender<DiskMsg>,
    pub manager_tx: mpsc::Sender<PeerManagerMsg>,
    /// The handshake every session sends, computed once by the manager.
    pub handshake: Handshake,
}

/// Exchange handshakes over a fresh TCP stream and switch it to the
/// message codec, keeping whatever the remote already sent buffered.
pub async fn establish(
    stream: TcpStream,
    ours: &Handshake,
    direction: Direction,
) -> Result<(PeerStream, Handshake), Error> {
    let mut socket = Framed::new(stream, HandshakeCodec);

    if direction == Direction::Outbound {
        socket.send(ours.clone()).await?;
    }

    let Some(Ok(theirs)) = socket.next().await else {
        return Err(Error::HandshakeInvalid);
    };
    if !ours.validate(&theirs) {
        return Err(Error::HandshakeInvalid);
    }

    if direction == Direction::Inbound {
        socket.send(ours.clone()).await?;
    }

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;

    Ok((Framed::from_parts(new_parts), theirs))
}

/// State of the metadata exchange with one peer.
#[derive(Default)]
struct ExtensionState {
    /// The id the remote chose for ut_metadata messages.
    ut_metadata: Option<u8>,
    /// Reassembly buffer while we fetch the info dictionary from this peer.
    metadata: Option<MetadataBuffer>,
}

pub struct Peer {
    ctx: SwarmCtx,
    addr: SocketAddr,
    socket: PeerStream,
    rx: mpsc::Receiver<PeerMsg>,

    remote_id: PeerId,
    conn: ConnectionState,

    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,

    /// Pieces the remote claims to have. Arrives as a Bitfield message or
    /// is allocated empty on the first Have.
    remote_pieces: Option<Bitfield>,
    remote_supports_extensions: bool,

    current_piece: Option<u64>,
    /// Next block index to request within the current piece.
    current_block: u32,
    /// Number of blocks in the current piece.
    block_count: u32,
    /// Blocks received of the current request batch.
    piece_received: u32,
    batch_len: u32,

    /// Requests from the remote we have not answered yet. An entry is
    /// removed when the block is sent or the peer cancels it.
    incoming_requests: HashSet<BlockInfo>,

    ext: ExtensionState,
}

impl Peer {
    /// Connect to a peer discovered through a tracker and run its session
    /// to completion.
    pub async fn start_outbound(
        ctx: SwarmCtx,
        addr: SocketAddr,
        rx: mpsc::Receiver<PeerMsg>,
    ) -> Result<(), Error> {
        let stream = TcpStream::connect(addr).await?;
        Self::start(ctx, stream, Direction::Outbound, rx).await
    }

    /// Run the session of a peer that connected to our listener.
    pub async fn start_inbound(
        ctx: SwarmCtx,
        stream: TcpStream,
        rx: mpsc::Receiver<PeerMsg>,
    ) -> Result<(), Error> {
        Self::start(ctx, stream, Direction::Inbound, rx).await
    }

    async fn start(
        ctx: SwarmCtx,
        stream: TcpStream,
        direction: Direction,
        rx: mpsc::Receiver<PeerMsg>,
    ) -> Result<(), Error> {
        let addr = stream.peer_addr()?;

        let (socket, theirs) =
            establish(stream, &ctx.handshake, direction).await?;

        let _ = ctx
            .manager_tx
            .send(PeerManagerMsg::Handshaked(addr))
            .await;

        let remote_supports_extensions = theirs.supports_extension_protocol();
        let mut peer = Peer {
            ctx,
            addr,
            socket,
            rx,
            remote_id: theirs.peer_id,
            conn: ConnectionState::Handshook,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_pieces: None,
            remote_supports_extensions,
            current_piece: None,
            current_block: 0,
            block_count: 0,
            piece_received: 0,
            batch_len: 0,
            incoming_requests: HashSet::new(),
            ext: ExtensionState::default(),
        };

        let result = peer.run().await;

        debug!(
            "session with {addr} over, am_interested={} peer_interested={}",
            peer.am_interested, peer.peer_interested
        );

        // whatever happened, a piece in flight goes back to the pool
        if let Some(piece) = peer.current_piece.take() {
            peer.ctx.pieces.piece_failed(piece);
        }
        result
    }

    #[tracing::instrument(skip(self), fields(addr = %self.addr))]
    async fn run(&mut self) -> Result<(), Error> {
        debug!("handshake complete with {}", self.remote_id);

        // bitfield goes out first, then the unchoke; this client serves
        // every interested peer
        if self.ctx.metainfo.is_ready() {
            self.socket.send(self.ctx.pieces.as_message()).await?;
        }
        self.socket.send(Message::Unchoke).await?;
        self.am_choking = false;

        if self.remote_supports_extensions {
            let handshake = ExtendedHandshake::supported(
                self.ctx.metainfo.metadata_size(),
            );
            self.socket
                .send(Message::Extended(ExtendedMessage(
                    0,
                    handshake.to_bencode(),
                )))
                .await?;
        }

        // a peer with no assignable piece is retried on a timer
        let mut assign_interval = interval(Duration::from_secs(10));
        let mut keep_alive_interval = interval_at(
            Instant::now() + Duration::from_secs(120),
            Duration::from_secs(120),
        );

        loop {
            select! {
                message = self.socket.next() => match message {
                    Some(Ok(message)) => self.on_message(message).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::PeerClosedSocket),
                },
                Some(msg) = self.rx.recv() => match msg {
                    PeerMsg::HavePiece(piece) => {
                        let remote_has = self
                            .remote_pieces
                            .as_ref()
                            .and_then(|pieces| {
                                pieces.get(piece as usize).map(|bit| *bit)
                            })
                            .unwrap_or(false);
                        if !remote_has {
                            self.socket
                                .send(Message::Have(piece as usize))
                                .await?;
                        }
                    }
                    PeerMsg::Quit => {
                        debug!("quit");
                        return Ok(());
                    }
                },
                _ = assign_interval.tick() => self.try_assign().await?,
                _ = keep_alive_interval.tick() => {
                    self.socket.send(Message::KeepAlive).await?;
                }
            }
        }
    }

    async fn on_message(&mut self, message: Message) -> Result<(), Error> {
        match message {
            Message::KeepAlive => {
                debug!("keepalive");
            }
            Message::Choke => {
                debug!("choke");
                self.peer_choking = true;
                // a piece in flight will not finish now, release it
                self.fail_current_piece();
            }
            Message::Unchoke => {
                debug!("unchoke");
                self.peer_choking = false;
                if self.conn == ConnectionState::Handshook {
                    self.conn = ConnectionState::Idle;
                }
                self.try_assign().await?;
            }
            Message::Interested => {
                debug!("interested");
                self.peer_interested = true;
            }
            Message::NotInterested => {
                debug!("not interested");
                self.peer_interested = false;
            }
            Message::Have(piece) => {
                self.on_have(piece as u64).await?;
            }
            Message::Bitfield(bitfield) => {
                self.on_bitfield(bitfield).await?;
            }
            Message::Request(block_info) => {
                self.on_request(block_info).await?;
            }
            Message::Piece(block) => {
                self.on_piece(block).await?;
            }
            Message::Cancel(block_info) => {
                debug!("cancel {block_info:?}");
                self.incoming_requests.remove(&block_info);
            }
            Message::Extended(message) => {
                self.on_extended(message).await?;
            }
        }
        Ok(())
    }

    async fn on_have(&mut self, piece: u64) -> Result<(), Error> {
        debug!("have {piece}");

        // some peers send an incomplete bitfield followed by a stream of
        // Have messages, allocate on demand
        let piece_count = self.ctx.metainfo.piece_count().max(piece + 1);
        let pieces = self
            .remote_pieces
            .get_or_insert_with(|| Bitfield::repeat(false, piece_count as usize));
        if piece as usize >= pieces.len() {
            pieces.resize(piece as usize + 1, false);
        }
        pieces.set(piece as usize, true);

        self.maybe_interested().await?;
        self.try_assign().await
    }

    async fn on_bitfield(&mut self, bitfield: Bitfield) -> Result<(), Error> {
        debug!("bitfield of {} bits", bitfield.len());

        // the wire pads the bitfield to a whole byte; when the torrent
        // description is known the byte length must match exactly
        if self.ctx.metainfo.is_ready() {
            let expected = self.ctx.metainfo.piece_count().div_ceil(8) * 8;
            if bitfield.len() as u64 != expected {
                warn!("peer sent a wrongly sized bitfield, ignoring it");
                return Ok(());
            }
        }
        self.remote_pieces = Some(bitfield);

        self.maybe_interested().await?;
        self.try_assign().await
    }

    /// Become interested when the remote has a piece we lack, and not
    /// interested once it no longer does.
    async fn maybe_interested(&mut self) -> Result<(), Error> {
        let interesting = match (
            self.ctx.metainfo.is_ready(),
            self.remote_pieces.as_ref(),
        ) {
            // while the description is unknown every peer is interesting
            (false, _) => true,
            (true, None) => false,
            (true, Some(remote)) => remote
                .iter_ones()
                .any(|piece| !self.ctx.pieces.has_piece(piece as u64)),
        };

        if interesting && !self.am_interested {
            debug!("sending interested");
            self.am_interested = true;
            self.socket.send(Message::Interested).await?;
        }
        Ok(())
    }

    /// Remote bitfield resized to the piece count, required by
    /// `assign_piece`.
    fn normalized_remote(&self) -> Option<Bitfield> {
        let remote = self.remote_pieces.as_ref()?;
        let piece_count = self.ctx.pieces.piece_count() as usize;
        let mut normalized = remote.clone();
        normalized.resize(piece_count, false);
        Some(normalized)
    }

    /// When idle and unchoked, ask the piece map for work and start the
    /// request pipeline. Peers with no assignable piece stay idle and are
    /// retried by the caller's timer.
    async fn try_assign(&mut self) -> Result<(), Error> {
        if self.current_piece.is_some()
            || self.peer_choking
            || self.conn == ConnectionState::Handshook
            || !self.ctx.metainfo.is_ready()
        {
            return Ok(());
        }

        let Some(remote) = self.normalized_remote() else {
            return Ok(());
        };

        match self.ctx.pieces.assign_piece(&remote) {
            Some(piece) => {
                info!("assigned piece {piece}");
                let piece_size = self.ctx.metainfo.piece_size(piece);
                self.current_piece = Some(piece);
                self.conn = ConnectionState::DownloadingPiece;
                self.current_block = 0;
                self.block_count =
                    piece_size.div_ceil(CONFIG.block_length as u64) as u32;
                self.request_batch().await?;
            }
            None => {
                debug!("no assignable piece");
            }
        }
        Ok(())
    }

    /// Pipeline the next batch of block requests for the current piece.
    async fn request_batch(&mut self) -> Result<(), Error> {
        let Some(piece) = self.current_piece else {
            return Ok(());
        };
        let piece_size = self.ctx.metainfo.piece_size(piece);
        let block_length = CONFIG.block_length;

        let batch_end = (self.current_block + CONFIG.request_per_call)
            .min(self.block_count);
        self.batch_len = batch_end - self.current_block;
        self.piece_received = 0;

        for block in self.current_block..batch_end {
            let begin = block * block_length;
            // the last block of the piece may be truncated
            let len = (piece_size - begin as u64).min(block_length as u64);

            self.socket
                .send(Message::Request(BlockInfo {
                    index: piece as u32,
                    begin,
                    len: len as u32,
                }))
                .await?;
        }
        self.current_block = batch_end;
        Ok(())
    }

    /// Release the piece in flight and go back to idle.
    fn fail_current_piece(&mut self) {
        if let Some(piece) = self.current_piece.take() {
            self.ctx.pieces.piece_failed(piece);
        }
        if self.conn == ConnectionState::DownloadingPiece {
            self.conn = ConnectionState::Idle;
        }
    }

    async fn on_piece(&mut self, block: Block) -> Result<(), Error> {
        let Some(piece) = self.current_piece else {
            debug!("stray block for piece {}, ignoring", block.index);
            return Ok(());
        };
        if block.index as u64 != piece {
            debug!("block for piece {} while downloading {piece}", block.index);
            return Ok(());
        }

        let len = block.block.len() as u64;
        self.ctx.metainfo.add_downloaded(len);

        let (tx, rx) = oneshot::channel();
        self.ctx
            .disk_tx
            .send(DiskMsg::WriteBlock { block, recipient: tx })
            .await?;

        match rx.await? {
            Err(e) => {
                warn!("block write failed: {e}");
                self.fail_current_piece();
            }
            Ok(WriteStatus { piece_complete: true, sha_passed: true }) => {
                info!("downloaded piece {piece}");
                self.ctx.pieces.piece_success(piece);
                self.current_piece = None;
                self.conn = ConnectionState::Idle;
                self.try_assign().await?;
            }
            Ok(WriteStatus { piece_complete: true, sha_passed: false }) => {
                warn!("piece {piece} failed verification, releasing it");
                self.fail_current_piece();
            }
            Ok(_) => {
                self.piece_received += 1;
                if self.piece_received == self.batch_len
                    && self.current_block < self.block_count
                {
                    self.request_batch().await?;
                }
            }
        }
        Ok(())
    }

    async fn on_request(&mut self, block_info: BlockInfo) -> Result<(), Error> {
        debug!("request {block_info:?}");

        if block_info.len > CONFIG.max_message_length {
            return Err(Error::MessageTooLarge(block_info.len as usize));
        }
        if self.am_choking
            || !self.ctx.pieces.has_piece(block_info.index as u64)
        {
            return Ok(());
        }
        if self.incoming_requests.contains(&block_info) {
            warn!("peer sent a duplicate block request");
        }
        self.incoming_requests.insert(block_info.clone());

        let (tx, rx) = oneshot::channel();
        self.ctx
            .disk_tx
            .send(DiskMsg::ReadBlock {
                block_info: block_info.clone(),
                recipient: tx,
            })
            .await?;
        let bytes = rx.await??;

        // the peer may have cancelled while the read was in flight
        if self.incoming_requests.remove(&block_info) {
            self.ctx.metainfo.add_uploaded(bytes.len() as u64);
            self.socket
                .send(Message::Piece(Block {
                    index: block_info.index as usize,
                    begin: block_info.begin,
                    block: bytes,
                }))
                .await?;
        }
        Ok(())
    }

    async fn on_extended(
        &mut self,
        message: ExtendedMessage,
    ) -> Result<(), Error> {
        let ExtendedMessage(ext_id, payload) = message;
        match ext_id {
            // the extended handshake
            0 => {
                let handshake = ExtendedHandshake::from_bencode(&payload)?;
                debug!("extended handshake {handshake:?}");
                self.ext.ut_metadata = handshake.ut_metadata;

                if !self.ctx.metainfo.is_ready() {
                    if let Some(size) = handshake.metadata_size {
                        self.request_metadata(size).await?;
                    }
                }
            }
            UT_METADATA_ID => {
                let message = Metadata::from_bencode(&payload)?;
                self.on_metadata(message).await?;
            }
            other => {
                debug!("message for unknown extension {other}");
            }
        }
        Ok(())
    }

    /// Start fetching the info dictionary from this peer.
    async fn request_metadata(&mut self, size: u64) -> Result<(), Error> {
        let Some(remote_id) = self.ext.ut_metadata else {
            return Ok(());
        };
        if size == 0 || self.ext.metadata.is_some() {
            return Ok(());
        }

        info!("fetching {size} bytes of metadata");
        let buffer = MetadataBuffer::new(size);
        for piece in buffer.missing() {
            self.socket
                .send(Message::Extended(ExtendedMessage(
                    remote_id,
                    Metadata::Request(piece).to_bencode(),
                )))
                .await?;
        }
        self.ext.metadata = Some(buffer);
        Ok(())
    }

    async fn on_metadata(&mut self, message: Metadata) -> Result<(), Error> {
        match message {
            Metadata::Request(piece) => {
                let Some(remote_id) = self.ext.ut_metadata else {
                    return Ok(());
                };
                let raw_info = self.ctx.metainfo.raw_info();
                let reply = match extension::info_piece(&raw_info, piece) {
                    Some(data) => Metadata::Data(
                        piece,
                        raw_info.len() as u64,
                        data.to_vec(),
                    ),
                    None => Metadata::Reject(piece),
                };
                self.socket
                    .send(Message::Extended(ExtendedMessage(
                        remote_id,
                        reply.to_bencode(),
                    )))
                    .await?;
            }
            Metadata::Data(piece, _total_size, data) => {
                if self.ctx.metainfo.is_ready() {
                    return Ok(());
                }
                let Some(buffer) = self.ext.metadata.as_mut() else {
                    return Ok(());
                };
                buffer.insert(piece, data);

                let Some(raw_info) = buffer.assemble() else {
                    return Ok(());
                };

                if InfoHash::hash_of(&raw_info) != self.ctx.metainfo.info_hash
                {
                    warn!("assembled metadata does not match the info hash");
                    buffer.clear();
                    let remote_id = self.ext.ut_metadata.unwrap_or_default();
                    for piece in buffer.missing() {
                        self.socket
                            .send(Message::Extended(ExtendedMessage(
                                remote_id,
                                Metadata::Request(piece).to_bencode(),
                            )))
                            .await?;
                    }
                    return Ok(());
                }

                let info = Element::decode(&raw_info)?;
                self.ctx.metainfo.load_info(&info, raw_info)?;
                info!("metadata exchange complete, download may start");
            }
            Metadata::Reject(piece) => {
                debug!("peer rejected metadata piece {piece}");
                self.ext.metadata = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[tokio::test]
    async fn outbound_handshake_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ours = Handshake::new(InfoHash([1u8; 20]), PeerId([2u8; 20]));
        let theirs = Handshake::new(InfoHash([1u8; 20]), PeerId([3u8; 20]));

        let remote = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            stream
                .write_all(&theirs.serialize().unwrap())
                .await
                .unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (_socket, received) =
            establish(stream, &ours, Direction::Outbound).await.unwrap();

        assert_eq!(received.peer_id.0, [3u8; 20]);
        // the remote got our full handshake
        let sent = remote.await.unwrap();
        assert_eq!(sent, ours.serialize().unwrap());
    }

    #[tokio::test]
    async fn mismatched_info_hash_ends_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ours = Handshake::new(InfoHash([1u8; 20]), PeerId([2u8; 20]));
        // different torrent on the remote side
        let theirs = Handshake::new(InfoHash([9u8; 20]), PeerId([3u8; 20]));

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            let _ = stream.write_all(&theirs.serialize().unwrap()).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let result = establish(stream, &ours, Direction::Outbound).await;

        assert!(matches!(result, Err(Error::HandshakeInvalid)));
    }

    #[tokio::test]
    async fn inbound_handshake_replies_after_validating() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ours = Handshake::new(InfoHash([1u8; 20]), PeerId([2u8; 20]));
        let ours_clone = ours.clone();

        let local = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            establish(stream, &ours_clone, Direction::Inbound).await
        });

        let theirs = Handshake::new(InfoHash([1u8; 20]), PeerId([4u8; 20]));
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&theirs.serialize().unwrap()).await.unwrap();

        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, ours.serialize().unwrap());

        let (_socket, received) = local.await.unwrap().unwrap();
        assert_eq!(received.peer_id.0, [4u8; 20]);
    }
}
