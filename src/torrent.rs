use crate::constants::BLOCK_SIZE;
use crate::data_structures::{Bitmap, BlockMap, ID};
use crate::metainfo::{Metainfo, Mode};
use crate::unsigned_ceil_div;
use anyhow::{ensure, Context, Result};
use std::fmt;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// One file of the transfer, placed at `offset` within the logical
/// concatenation of the whole file set.
#[derive(Debug)]
pub struct FileItem {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// Piece-layout state and disk persistence for one active transfer.
///
/// Verified/acquired bitmaps are shared by clone with the peer layer; all
/// mutation goes through `write_block` and `verify`. Newly verified piece
/// indexes are published on the channel returned by the constructor.
pub struct Torrent {
    pub name: String,
    download_dir: PathBuf,
    files: Vec<FileItem>,
    piece_length: usize,
    block_length: usize,
    piece_hashes: Vec<ID>,
    pub info_hash: ID,
    pub is_piece_verified: Bitmap,
    pub is_block_acquired: BlockMap,
    uploaded: AtomicU64,
    file_locks: Vec<Mutex<()>>,
    verified_tx: mpsc::UnboundedSender<usize>,
}

impl Torrent {
    pub fn new(
        metainfo: &Metainfo,
        download_dir: impl Into<PathBuf>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<usize>)> {
        Self::with_block_length(metainfo, download_dir, BLOCK_SIZE)
    }

    fn with_block_length(
        metainfo: &Metainfo,
        download_dir: impl Into<PathBuf>,
        block_length: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<usize>)> {
        let info = &metainfo.info;

        let files = match &info.mode {
            Mode::Single { length } => vec![FileItem {
                path: PathBuf::from(&info.name),
                length: *length,
                offset: 0,
            }],
            Mode::Multi { files } => {
                let mut running = 0;
                let mut items = Vec::with_capacity(files.len());
                for file in files {
                    let mut path = PathBuf::from(&info.name);
                    for segment in &file.path {
                        path.push(segment);
                    }
                    items.push(FileItem {
                        path,
                        length: file.length,
                        offset: running,
                    });
                    running += file.length;
                }
                items
            }
        };

        let total_size: u64 = files.iter().map(|f| f.length).sum();
        ensure!(total_size > 0, "torrent holds no data");

        let piece_length = usize::try_from(info.piece_length).context("piece length overflow")?;
        ensure!(piece_length > 0, "piece length must be positive");

        let piece_count = info.pieces.len();
        let expected_count = unsigned_ceil_div!(total_size, info.piece_length);
        ensure!(
            piece_count as u64 == expected_count,
            "torrent has {piece_count} piece hashes but the file set requires {expected_count}"
        );

        let piece_size = |piece: usize| -> usize {
            if piece == piece_count - 1 {
                let remainder = (total_size % info.piece_length) as usize;
                if remainder != 0 {
                    return remainder;
                }
            }
            piece_length
        };

        let block_counts: Vec<usize> = (0..piece_count)
            .map(|piece| unsigned_ceil_div!(piece_size(piece), block_length))
            .collect();

        let file_locks = files.iter().map(|_| Mutex::new(())).collect();

        let (verified_tx, verified_rx) = mpsc::unbounded_channel();

        let torrent = Self {
            name: info.name.clone(),
            download_dir: download_dir.into(),
            files,
            piece_length,
            block_length,
            piece_hashes: info.pieces.clone(),
            info_hash: info.hash()?,
            is_piece_verified: Bitmap::new(piece_count),
            is_block_acquired: BlockMap::new(block_counts),
            uploaded: AtomicU64::new(0),
            file_locks,
            verified_tx,
        };

        Ok((torrent, verified_rx))
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn block_length(&self) -> usize {
        self.block_length
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_size(&self, piece: usize) -> usize {
        if piece == self.piece_count() - 1 {
            let remainder = (self.total_size() % self.piece_length as u64) as usize;
            if remainder != 0 {
                return remainder;
            }
        }

        self.piece_length
    }

    pub fn block_size(&self, piece: usize, block: usize) -> usize {
        if block == self.block_count(piece) - 1 {
            let remainder = self.piece_size(piece) % self.block_length;
            if remainder != 0 {
                return remainder;
            }
        }

        self.block_length
    }

    pub fn block_count(&self, piece: usize) -> usize {
        unsigned_ceil_div!(self.piece_size(piece), self.block_length)
    }

    /// Fresh unshared (piece, block) map with this torrent's shape, for
    /// tracking per-peer in-flight requests.
    pub fn new_block_map(&self) -> BlockMap {
        BlockMap::new((0..self.piece_count()).map(|piece| self.block_count(piece)))
    }

    pub fn verified_piece_count(&self) -> usize {
        self.is_piece_verified.weight()
    }

    pub fn is_completed(&self) -> bool {
        self.verified_piece_count() == self.piece_count()
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Byte count reported to trackers. Counts whole pieces, so a short
    /// final piece is over-reported once it verifies.
    pub fn downloaded(&self) -> u64 {
        self.piece_length as u64 * self.verified_piece_count() as u64
    }

    pub fn left(&self) -> u64 {
        self.total_size().saturating_sub(self.downloaded())
    }

    fn absolute_path(&self, file: &FileItem) -> PathBuf {
        self.download_dir.join(&file.path)
    }

    /// Maps a logical byte range onto the file set. `None` means some
    /// overlapping file does not exist on disk yet or is still short.
    pub async fn read(&self, start: u64, length: usize) -> Result<Option<Vec<u8>>> {
        let end = start + length as u64;
        let mut buffer = vec![0u8; length];

        for file in self.files.iter() {
            if end <= file.offset || start >= file.offset + file.length {
                continue;
            }

            let path = self.absolute_path(file);
            let mut handle = match fs::File::open(&path).await {
                Ok(handle) => handle,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to open {}", path.display()))
                }
            };

            let file_start = start.saturating_sub(file.offset);
            let file_end = (end - file.offset).min(file.length);
            let chunk_length = (file_end - file_start) as usize;
            let buffer_start = file.offset.saturating_sub(start) as usize;

            handle.seek(SeekFrom::Start(file_start)).await?;

            match handle
                .read_exact(&mut buffer[buffer_start..buffer_start + chunk_length])
                .await
            {
                Ok(_) => (),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to read {}", path.display()))
                }
            }
        }

        Ok(Some(buffer))
    }

    pub async fn read_piece(&self, piece: usize) -> Result<Option<Vec<u8>>> {
        self.read(
            piece as u64 * self.piece_length as u64,
            self.piece_size(piece),
        )
        .await
    }

    pub async fn read_block(&self, piece: usize, begin: usize, length: usize) -> Result<Option<Vec<u8>>> {
        self.read(
            piece as u64 * self.piece_length as u64 + begin as u64,
            length,
        )
        .await
    }

    /// Writes a logical byte range across the file set, creating missing
    /// directories. Writes landing in the same file are serialized by a
    /// per-file lock; disjoint files proceed independently.
    pub async fn write(&self, start: u64, bytes: &[u8]) -> Result<()> {
        let end = start + bytes.len() as u64;

        for (i, file) in self.files.iter().enumerate() {
            if end <= file.offset || start >= file.offset + file.length {
                continue;
            }

            let path = self.absolute_path(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }

            let file_start = start.saturating_sub(file.offset);
            let file_end = (end - file.offset).min(file.length);
            let chunk_length = (file_end - file_start) as usize;
            let buffer_start = file.offset.saturating_sub(start) as usize;

            let _guard = self.file_locks[i].lock().await;

            let mut handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;

            handle.seek(SeekFrom::Start(file_start)).await?;
            handle
                .write_all(&bytes[buffer_start..buffer_start + chunk_length])
                .await?;
            handle.flush().await?;
        }

        Ok(())
    }

    pub async fn write_block(&self, piece: usize, block: usize, data: &[u8]) -> Result<()> {
        ensure!(piece < self.piece_count(), "piece {piece} out of range");
        ensure!(
            block < self.block_count(piece),
            "block {block} out of range for piece {piece}"
        );
        ensure!(
            data.len() == self.block_size(piece, block),
            "block ({piece}, {block}) expects {} bytes, got {}",
            self.block_size(piece, block),
            data.len()
        );

        self.write(
            piece as u64 * self.piece_length as u64 + block as u64 * self.block_length as u64,
            data,
        )
        .await?;

        self.is_block_acquired.set(piece, block, true);

        self.verify(piece).await
    }

    async fn piece_hash(&self, piece: usize) -> Result<Option<ID>> {
        let Some(data) = self.read_piece(piece).await? else {
            return Ok(None);
        };

        Ok(Some(ID::sha1(&data)))
    }

    /// Hash-checks one piece against its expected digest.
    ///
    /// A match marks the piece verified, marks all its blocks acquired and
    /// notifies once per transition into the verified state. A mismatch on
    /// a fully acquired piece discards the acquired flags so the piece is
    /// downloaded again; a partially acquired piece is left alone.
    pub async fn verify(&self, piece: usize) -> Result<()> {
        let hash = self.piece_hash(piece).await?;
        let matches = hash.is_some_and(|h| h == self.piece_hashes[piece]);

        if matches {
            let newly_verified = !self.is_piece_verified.get(piece);

            self.is_piece_verified.set(piece, true);
            self.is_block_acquired.fill_piece(piece);

            if newly_verified {
                debug!("piece {piece} verified");
                let _ = self.verified_tx.send(piece);
            }

            return Ok(());
        }

        self.is_piece_verified.set(piece, false);

        if self.is_block_acquired.is_piece_complete(piece) {
            debug!("piece {piece} corrupt with all blocks present, discarding");
            self.is_block_acquired.clear_piece(piece);
        }

        Ok(())
    }

    /// Hash-checks everything already on disk so a restarted download
    /// resumes instead of starting over.
    pub async fn check_existing_data(&self) {
        for piece in 0..self.piece_count() {
            if let Err(e) = self.verify(piece).await {
                warn!("failed to verify piece {piece}: {e:#}");
            }
        }

        info!(
            "resume check: {}/{} pieces already verified",
            self.verified_piece_count(),
            self.piece_count()
        );
    }
}

impl fmt::Display for Torrent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[Torrent: {} {}B ({}x{}B) verified {}/{} {}]",
            self.name,
            self.total_size(),
            self.piece_count(),
            self.piece_length,
            self.verified_piece_count(),
            self.piece_count(),
            self.info_hash,
        )
    }
}
