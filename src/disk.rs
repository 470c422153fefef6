//! Disk is responsible for the file I/O of the torrent.
//!
//! While downloading, every piece lands in a single working file named
//! `<name>.tmp`. Blocks are written at `piece_index * piece_length + begin`;
//! the write that completes a piece re-reads it and verifies its SHA-1.
//! When the working file pre-exists, a parallel resume scan recovers every
//! piece that already matches its hash. On completion the working file is
//! renamed (single file torrents) or sliced into the torrent's files
//! (multi file torrents).

use std::{io::SeekFrom, path::PathBuf, sync::Arc, time::Instant};

use sha1::{Digest, Sha1};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    select,
    sync::{mpsc, oneshot, watch},
    task,
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::PieceMap,
    error::Error,
    metainfo::Metainfo,
    tcp_wire::{Block, BlockInfo},
    utils::to_human_readable,
};

/// Outcome of a block write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStatus {
    /// The block was the last one of its piece.
    pub piece_complete: bool,
    /// Only meaningful when `piece_complete`: the re-read piece matched its
    /// SHA-1 hash.
    pub sha_passed: bool,
}

#[derive(Debug)]
pub enum DiskMsg {
    /// Write the given block to the working file. The reply tells whether
    /// the block completed its piece and whether the hash check passed.
    WriteBlock {
        block: Block,
        recipient: oneshot::Sender<Result<WriteStatus, Error>>,
    },
    /// Read a block back, to serve a Request from a peer.
    ReadBlock {
        block_info: BlockInfo,
        recipient: oneshot::Sender<Result<Vec<u8>, Error>>,
    },
    Quit,
}

/// The piece store. Owns the working file and runs as an actor so writes
/// from many peer sessions are serialized and a piece's verify always
/// happens after all of its writes.
pub struct Disk {
    metainfo: Arc<Metainfo>,
    pieces: Arc<PieceMap>,
    rx: mpsc::Receiver<DiskMsg>,
    /// Pinged by the piece completion handler; the store re-checks the
    /// completion predicate and extracts when the torrent is done.
    completion_rx: mpsc::UnboundedReceiver<()>,
    /// Flips to true after extraction, releases `Client::wait`.
    done: watch::Sender<bool>,
    download_dir: PathBuf,
    file: Option<File>,
}

impl Disk {
    pub fn new(
        metainfo: Arc<Metainfo>,
        pieces: Arc<PieceMap>,
        rx: mpsc::Receiver<DiskMsg>,
        completion_rx: mpsc::UnboundedReceiver<()>,
        done: watch::Sender<bool>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            metainfo,
            pieces,
            rx,
            completion_rx,
            done,
            download_dir,
            file: None,
        }
    }

    #[tracing::instrument(skip(self), name = "disk")]
    pub async fn run(&mut self) -> Result<(), Error> {
        self.init_file().await?;

        if self.metainfo.is_file_complete() {
            // nothing to download, the resume scan found every piece
            self.extract().await?;
            self.done.send_replace(true);
            return Ok(());
        }

        loop {
            select! {
                Some(msg) = self.rx.recv() => match msg {
                    DiskMsg::WriteBlock { block, recipient } => {
                        let result = self.write_block(block).await;
                        let _ = recipient.send(result);
                    }
                    DiskMsg::ReadBlock { block_info, recipient } => {
                        let result = self.read_block(block_info).await;
                        let _ = recipient.send(result);
                    }
                    DiskMsg::Quit => {
                        debug!("quit");
                        return Ok(());
                    }
                },
                Some(_) = self.completion_rx.recv() => {
                    if self.metainfo.is_file_complete() {
                        self.extract().await?;
                        self.done.send_replace(true);
                        return Ok(());
                    }
                }
                else => return Ok(()),
            }
        }
    }

    /// Open or create the working file sized to the torrent. A pre-existing
    /// file goes through the resume scan so finished pieces are not
    /// downloaded again.
    pub async fn init_file(&mut self) -> Result<(), Error> {
        let path = self.download_dir.join(self.metainfo.output_name());
        let file_exists =
            tokio::fs::try_exists(&path).await.unwrap_or(false);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|_| {
                Error::FileOpenError(path.display().to_string())
            })?;

        let total_length = self.metainfo.total_length();
        file.set_len(total_length).await?;
        info!(
            "opened the file {} ({})",
            path.display(),
            to_human_readable(total_length as f64)
        );
        self.file = Some(file);

        if file_exists {
            self.resume_scan(path).await?;
        }
        Ok(())
    }

    /// Hash every piece of the pre-existing working file against the
    /// torrent's piece hashes, marking the ones that survived. The piece
    /// index range is split across one OS thread per hardware thread, each
    /// with its own read handle.
    async fn resume_scan(&self, path: PathBuf) -> Result<(), Error> {
        let piece_count = self.metainfo.piece_count();
        let workers = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1)
            .min(piece_count);
        let piece_per_worker = piece_count / workers;

        info!("starting the resume scan with {workers} threads");
        let start_time = Instant::now();

        let metainfo = self.metainfo.clone();
        let pieces = self.pieces.clone();

        task::spawn_blocking(move || -> Result<(), Error> {
            std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(workers as usize);
                for worker in 0..workers {
                    let start = worker * piece_per_worker;
                    let end = if worker == workers - 1 {
                        piece_count
                    } else {
                        start + piece_per_worker
                    };
                    let metainfo = &metainfo;
                    let pieces = &pieces;
                    let path = &path;

                    handles.push(scope.spawn(move || -> Result<(), Error> {
                        use std::io::{Read, Seek};

                        let mut file = std::fs::File::open(path)?;
                        let mut buf = Vec::new();
                        for piece in start..end {
                            let size = metainfo.piece_size(piece) as usize;
                            buf.resize(size, 0);
                            file.seek(SeekFrom::Start(
                                piece * metainfo.piece_length(),
                            ))?;
                            file.read_exact(&mut buf)?;

                            let mut hasher = Sha1::new();
                            hasher.update(&buf);
                            let hash: [u8; 20] = hasher.finalize().into();

                            if hash == metainfo.piece_hash(piece) {
                                pieces.set_piece(piece);
                            }
                        }
                        Ok(())
                    }));
                }
                for handle in handles {
                    handle.join().expect("resume scan worker panicked")?;
                }
                Ok(())
            })
        })
        .await
        .expect("resume scan task panicked")?;

        info!(
            "finished the resume scan in {:?}, found {} valid pieces out of {}",
            start_time.elapsed(),
            self.metainfo.pieces_done(),
            piece_count,
        );
        Ok(())
    }

    /// Write one block at its position in the working file. The write that
    /// completes a piece re-reads the whole piece and verifies its hash.
    pub async fn write_block(
        &mut self,
        block: Block,
    ) -> Result<WriteStatus, Error> {
        let piece_index = block.index as u64;
        let piece_length = self.metainfo.piece_length();
        let piece_size = self.metainfo.piece_size(piece_index);
        let begin = block.begin as u64;
        let len = block.block.len() as u64;

        if piece_index >= self.metainfo.piece_count()
            || begin + len > piece_size
        {
            return Err(Error::MessageResponse);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::FileOpenError("working file".into()))?;

        let offset = piece_index * piece_length + begin;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&block.block).await?;

        if begin + len < piece_size {
            return Ok(WriteStatus { piece_complete: false, sha_passed: false });
        }

        // last block of the piece, verify the whole piece
        let mut buf = vec![0u8; piece_size as usize];
        file.seek(SeekFrom::Start(piece_index * piece_length)).await?;
        file.read_exact(&mut buf).await?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let hash: [u8; 20] = hasher.finalize().into();
        let sha_passed = hash == self.metainfo.piece_hash(piece_index);

        if !sha_passed {
            warn!("piece {piece_index} failed its hash check");
        }

        Ok(WriteStatus { piece_complete: true, sha_passed })
    }

    /// Read a block back from the working file.
    pub async fn read_block(
        &mut self,
        block_info: BlockInfo,
    ) -> Result<Vec<u8>, Error> {
        let piece_index = block_info.index as u64;
        let piece_length = self.metainfo.piece_length();
        let piece_size = self.metainfo.piece_size(piece_index);
        let begin = block_info.begin as u64;
        let len = block_info.len as u64;

        if piece_index >= self.metainfo.piece_count()
            || begin + len > piece_size
        {
            return Err(Error::MessageResponse);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::FileOpenError("working file".into()))?;

        file.seek(SeekFrom::Start(piece_index * piece_length + begin)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Turn the working file into the torrent's real files.
    pub async fn extract(&mut self) -> Result<(), Error> {
        let files = self.metainfo.files();
        let work_path = self.download_dir.join(self.metainfo.output_name());

        if let Some(file) = self.file.as_mut() {
            file.sync_all().await?;
        }

        if files.len() == 1 {
            // single file mode, the working file becomes the file
            let target = self.download_dir.join(&files[0].path);
            tokio::fs::rename(&work_path, &target).await?;
            info!("extracted {}", target.display());
            return Ok(());
        }

        info!("started extracting the torrent files");
        let folder = self.download_dir.join(self.metainfo.name());
        tokio::fs::create_dir_all(&folder).await?;

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::FileOpenError("working file".into()))?;

        let mut offset = 0u64;
        let mut buf = vec![0u8; 1 << 20];
        for entry in files {
            let target = folder.join(&entry.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut out = File::create(&target).await?;

            file.seek(SeekFrom::Start(offset)).await?;
            let mut remaining = entry.length;
            while remaining > 0 {
                let chunk = remaining.min(buf.len() as u64) as usize;
                file.read_exact(&mut buf[..chunk]).await?;
                out.write_all(&buf[..chunk]).await?;
                remaining -= chunk as u64;
            }
            out.flush().await?;

            info!("created file {}", target.display());
            offset += entry.length;
        }
        Ok(())
    }
}
