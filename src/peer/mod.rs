pub mod handshake;
pub mod message;

use crate::constants::{HANDSHAKE_LENGTH, KEEP_ALIVE_MIN_INTERVAL_SECS};
use crate::data_structures::{Bitmap, BlockMap, ID};
use crate::torrent::Torrent;
use anyhow::{anyhow, bail, ensure, Result};
use bytes::Bytes;
use handshake::Handshake;
use message::{pack_bitfield, unpack_bitfield, Message, Piece, Request};
use std::mem::discriminant;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

const COMMAND_CHANNEL_CAPACITY: usize = 1 << 5;
const READ_CHUNK_SIZE: usize = 1 << 12;

/// A block the remote side asked us to upload.
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub addr: SocketAddrV4,
    pub piece: usize,
    pub begin: usize,
    pub length: usize,
    pub is_cancelled: bool,
}

/// A block the remote side delivered to us.
#[derive(Debug, Clone)]
pub struct DataPackage {
    pub addr: SocketAddrV4,
    pub piece: usize,
    pub block: usize,
    pub data: Bytes,
}

#[derive(Debug)]
pub enum Event {
    BlockRequested(DataRequest),
    BlockCancelled(DataRequest),
    BlockReceived(DataPackage),
    StateChanged,
    Disconnected,
}

#[derive(Debug)]
pub struct PeerEvent {
    pub addr: SocketAddrV4,
    pub event: Event,
}

#[derive(Debug)]
pub enum Command {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Request {
        piece: usize,
        begin: usize,
        length: usize,
    },
    Piece {
        piece: usize,
        begin: usize,
        data: Bytes,
    },
    Cancel {
        piece: usize,
        begin: usize,
        length: usize,
    },
    Disconnect,
}

/// Connection state shared between the connection task and the scheduler.
/// Flag reads from the scheduler are lock-free and tolerate staleness.
#[derive(Debug)]
pub struct PeerState {
    pub is_handshake_sent: AtomicBool,
    pub is_handshake_received: AtomicBool,
    pub is_choke_sent: AtomicBool,
    pub is_choke_received: AtomicBool,
    pub is_interested_sent: AtomicBool,
    pub is_interested_received: AtomicBool,
    /// Pieces the remote side advertises via bitfield/have.
    pub is_piece_downloaded: Bitmap,
    /// Blocks we asked this peer for and that are still unresolved.
    pub is_block_requested: BlockMap,
    last_active: StdMutex<Instant>,
    pub uploaded: AtomicU64,
    pub downloaded: AtomicU64,
}

impl PeerState {
    fn new(torrent: &Torrent) -> Self {
        Self {
            is_handshake_sent: AtomicBool::new(false),
            is_handshake_received: AtomicBool::new(false),
            is_choke_sent: AtomicBool::new(true),
            is_choke_received: AtomicBool::new(true),
            is_interested_sent: AtomicBool::new(false),
            is_interested_received: AtomicBool::new(false),
            is_piece_downloaded: Bitmap::new(torrent.piece_count()),
            is_block_requested: torrent.new_block_map(),
            last_active: StdMutex::new(Instant::now()),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap()
    }

    pub fn is_established(&self) -> bool {
        self.is_handshake_sent.load(Ordering::Relaxed)
            && self.is_handshake_received.load(Ordering::Relaxed)
    }

    pub fn pieces_downloaded_count(&self) -> usize {
        self.is_piece_downloaded.weight()
    }

    pub fn is_completed(&self, piece_count: usize) -> bool {
        self.pieces_downloaded_count() == piece_count
    }

    /// How many pieces this peer can give us that we still lack.
    pub fn pieces_required_available(&self, verified: &Bitmap) -> usize {
        self.is_piece_downloaded
            .to_bytes()
            .iter()
            .zip(verified.to_bytes().iter())
            .map(|(has, done)| (has & !done).count_ones() as usize)
            .sum()
    }

    pub fn blocks_requested(&self) -> usize {
        self.is_block_requested.weight()
    }
}

/// Owning reference to one peer connection: shared state plus the command
/// channel into its task. Dropping the handle does not kill the task; the
/// scheduler sends `Command::Disconnect` for that.
pub struct PeerHandle {
    pub addr: SocketAddrV4,
    pub state: Arc<PeerState>,
    cmd_tx: mpsc::Sender<Command>,
}

impl PeerHandle {
    /// Outbound connection from a tracker-supplied address.
    pub fn connect(
        addr: SocketAddrV4,
        torrent: Arc<Torrent>,
        local_id: ID,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self::spawn(None, addr, torrent, local_id, event_tx)
    }

    /// Inbound connection from the listener.
    pub fn accept(
        stream: TcpStream,
        addr: SocketAddrV4,
        torrent: Arc<Torrent>,
        local_id: ID,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self::spawn(Some(stream), addr, torrent, local_id, event_tx)
    }

    fn spawn(
        stream: Option<TcpStream>,
        addr: SocketAddrV4,
        torrent: Arc<Torrent>,
        local_id: ID,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let state = Arc::new(PeerState::new(&torrent));

        let connection = Connection {
            addr,
            torrent,
            local_id,
            state: state.clone(),
            event_tx,
            data: Vec::new(),
            last_keep_alive: None,
        };

        tokio::spawn(connection.run(stream, cmd_rx));

        Self {
            addr,
            state,
            cmd_tx,
        }
    }

    /// Queues a command without waiting. A peer whose task has died or
    /// whose queue is full just loses the command; it will either be
    /// retried by the next scheduling pass or the peer gets disconnected.
    pub fn send(&self, command: Command) {
        if let Err(e) = self.cmd_tx.try_send(command) {
            debug!(peer = %self.addr, "dropping command: {e}");
        }
    }
}

struct Connection {
    addr: SocketAddrV4,
    torrent: Arc<Torrent>,
    local_id: ID,
    state: Arc<PeerState>,
    event_tx: mpsc::Sender<PeerEvent>,
    /// Raw bytes received and not yet consumed as complete frames.
    data: Vec<u8>,
    last_keep_alive: Option<Instant>,
}

impl Connection {
    async fn run(mut self, stream: Option<TcpStream>, cmd_rx: mpsc::Receiver<Command>) {
        if let Err(e) = self.manage(stream, cmd_rx).await {
            debug!(peer = %self.addr, "connection closed: {e:#}");
        }

        debug!(
            peer = %self.addr,
            "disconnected, down {}, up {}",
            self.state.downloaded.load(Ordering::Relaxed),
            self.state.uploaded.load(Ordering::Relaxed)
        );

        let _ = self
            .event_tx
            .send(PeerEvent {
                addr: self.addr,
                event: Event::Disconnected,
            })
            .await;
    }

    #[instrument(skip_all, fields(peer = %self.addr))]
    async fn manage(
        &mut self,
        stream: Option<TcpStream>,
        mut cmd_rx: mpsc::Receiver<Command>,
    ) -> Result<()> {
        let mut stream = match stream {
            Some(stream) => stream,
            None => TcpStream::connect(self.addr).await?,
        };

        debug!("connected");

        let (mut rd, mut wr) = stream.split();

        self.send_handshake(&mut wr).await?;

        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            select! {
                read = rd.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        bail!("connection closed by peer");
                    }

                    self.state.touch();
                    self.data.extend_from_slice(&chunk[..n]);
                    self.drain_frames(&mut wr).await?;
                }
                command = cmd_rx.recv() => {
                    match command {
                        None | Some(Command::Disconnect) => return Ok(()),
                        Some(command) => self.execute_command(command, &mut wr).await?,
                    }
                }
            }
        }
    }

    /// Handshake frames are a fixed 68 bytes; afterwards frames are
    /// 4-byte length prefix plus payload.
    fn expected_frame_len(&self) -> Result<Option<usize>> {
        if !self.state.is_handshake_received.load(Ordering::Relaxed) {
            return Ok(Some(HANDSHAKE_LENGTH));
        }

        if self.data.len() < message::BYTES_IN_LEN_PREFIX {
            return Ok(None);
        }

        let frame_len = message::BYTES_IN_LEN_PREFIX + Message::announced_len(&self.data);

        let limit = self.max_frame_len();
        ensure!(
            frame_len <= limit,
            "frame of {frame_len} bytes exceeds the {limit} byte limit"
        );

        Ok(Some(frame_len))
    }

    fn max_frame_len(&self) -> usize {
        let piece_payload = 9 + self.torrent.block_length();
        let bitfield_payload = 1 + crate::unsigned_ceil_div!(self.torrent.piece_count().max(1), 8);

        message::BYTES_IN_LEN_PREFIX + piece_payload.max(bitfield_payload)
    }

    async fn drain_frames(&mut self, wr: &mut WriteHalf<'_>) -> Result<()> {
        loop {
            let Some(frame_len) = self.expected_frame_len()? else {
                return Ok(());
            };

            if self.data.len() < frame_len {
                return Ok(());
            }

            let frame: Vec<u8> = self.data.drain(..frame_len).collect();
            self.handle_frame(&frame, wr).await?;
        }
    }

    async fn handle_frame(&mut self, frame: &[u8], wr: &mut WriteHalf<'_>) -> Result<()> {
        if !self.state.is_handshake_received.load(Ordering::Relaxed) {
            let handshake = Handshake::from_bytes(frame)?;

            ensure!(
                handshake.info_hash() == self.torrent.info_hash,
                "handshake for the wrong torrent: expected={}, received={}",
                self.torrent.info_hash,
                handshake.info_hash()
            );

            debug!("<- handshake ({})", handshake.peer_id());
            self.state.is_handshake_received.store(true, Ordering::Relaxed);

            self.send_bitfield(wr).await?;

            return Ok(());
        }

        let message = Message::from_frame(frame)?;
        trace!("received {:?}", discriminant(&message));

        match message {
            Message::KeepAlive => debug!("<- keep alive"),
            Message::Choke => {
                self.state.is_choke_received.store(true, Ordering::Relaxed);
                self.emit(Event::StateChanged).await?;
            }
            Message::Unchoke => {
                self.state.is_choke_received.store(false, Ordering::Relaxed);
                self.emit(Event::StateChanged).await?;
            }
            Message::Interested => {
                self.state
                    .is_interested_received
                    .store(true, Ordering::Relaxed);
                self.emit(Event::StateChanged).await?;
            }
            Message::NotInterested => {
                self.state
                    .is_interested_received
                    .store(false, Ordering::Relaxed);
                self.emit(Event::StateChanged).await?;
            }
            Message::Have(index) => self.handle_have(index).await?,
            Message::Bitfield(bitfield) => self.handle_bitfield(&bitfield).await?,
            Message::Request(request) => self.handle_request(request, false).await?,
            Message::Cancel(request) => self.handle_request(request, true).await?,
            Message::Piece(piece) => self.handle_piece(piece).await?,
            Message::Port(port) => debug!("<- port {port}"),
        }

        Ok(())
    }

    async fn handle_have(&mut self, index: u32) -> Result<()> {
        let index = index as usize;
        ensure!(
            index < self.torrent.piece_count(),
            "have for piece {index} out of range"
        );

        self.state.is_piece_downloaded.set(index, true);
        debug!(
            "<- have {index} ({} available)",
            self.state.pieces_downloaded_count()
        );

        self.emit(Event::StateChanged).await
    }

    async fn handle_bitfield(&mut self, bitfield: &[u8]) -> Result<()> {
        let piece_count = self.torrent.piece_count();

        let Some(pieces) = unpack_bitfield(bitfield, piece_count) else {
            bail!(
                "bitfield of {} bytes does not cover {piece_count} pieces",
                bitfield.len()
            );
        };

        // merge: a peer never loses a piece it advertised before
        for (index, has) in pieces.iter().enumerate() {
            if *has {
                self.state.is_piece_downloaded.set(index, true);
            }
        }

        debug!(
            "<- bitfield ({} available)",
            self.state.pieces_downloaded_count()
        );

        self.emit(Event::StateChanged).await
    }

    async fn handle_request(&mut self, request: Request, cancel: bool) -> Result<()> {
        let piece = request.index as usize;
        ensure!(
            piece < self.torrent.piece_count(),
            "request for piece {piece} out of range"
        );
        ensure!(
            request.length as usize <= self.torrent.block_length(),
            "request of {} bytes exceeds the block size",
            request.length
        );

        let data_request = DataRequest {
            addr: self.addr,
            piece,
            begin: request.begin as usize,
            length: request.length as usize,
            is_cancelled: false,
        };

        if cancel {
            debug!("<- cancel {piece}, {}", request.begin);
            self.emit(Event::BlockCancelled(data_request)).await
        } else {
            debug!("<- request {piece}, {}, {}", request.begin, request.length);
            self.emit(Event::BlockRequested(data_request)).await
        }
    }

    async fn handle_piece(&mut self, piece: Piece) -> Result<()> {
        let index = piece.index as usize;
        let begin = piece.begin as usize;

        ensure!(
            index < self.torrent.piece_count(),
            "piece {index} out of range"
        );
        ensure!(
            begin % self.torrent.block_length() == 0,
            "piece {index} block offset {begin} is not block aligned"
        );

        let block = begin / self.torrent.block_length();
        ensure!(
            block < self.torrent.block_count(index),
            "piece {index} block {block} out of range"
        );

        debug!("<- piece {index}, {begin}, {}", piece.block.len());

        self.state
            .downloaded
            .fetch_add(piece.block.len() as u64, Ordering::Relaxed);

        self.emit(Event::BlockReceived(DataPackage {
            addr: self.addr,
            piece: index,
            block,
            data: piece.block,
        }))
        .await
    }

    async fn execute_command(&mut self, command: Command, wr: &mut WriteHalf<'_>) -> Result<()> {
        match command {
            Command::KeepAlive => {
                let recently = self
                    .last_keep_alive
                    .is_some_and(|t| t.elapsed() < Duration::from_secs(KEEP_ALIVE_MIN_INTERVAL_SECS));
                if !recently {
                    self.last_keep_alive = Some(Instant::now());
                    self.send_message(wr, Message::KeepAlive).await?;
                }
            }
            Command::Choke => {
                if !self.state.is_choke_sent.load(Ordering::Relaxed) {
                    self.state.is_choke_sent.store(true, Ordering::Relaxed);
                    self.send_message(wr, Message::Choke).await?;
                }
            }
            Command::Unchoke => {
                if self.state.is_choke_sent.load(Ordering::Relaxed) {
                    self.state.is_choke_sent.store(false, Ordering::Relaxed);
                    self.send_message(wr, Message::Unchoke).await?;
                }
            }
            Command::Interested => {
                if !self.state.is_interested_sent.load(Ordering::Relaxed) {
                    self.state.is_interested_sent.store(true, Ordering::Relaxed);
                    self.send_message(wr, Message::Interested).await?;
                }
            }
            Command::NotInterested => {
                if self.state.is_interested_sent.load(Ordering::Relaxed) {
                    self.state
                        .is_interested_sent
                        .store(false, Ordering::Relaxed);
                    self.send_message(wr, Message::NotInterested).await?;
                }
            }
            Command::Have(index) => self.send_message(wr, Message::Have(index)).await?,
            Command::Request {
                piece,
                begin,
                length,
            } => {
                self.send_message(
                    wr,
                    Message::Request(Request {
                        index: piece as u32,
                        begin: begin as u32,
                        length: length as u32,
                    }),
                )
                .await?;
            }
            Command::Piece { piece, begin, data } => {
                self.state
                    .uploaded
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.send_message(
                    wr,
                    Message::Piece(Piece {
                        index: piece as u32,
                        begin: begin as u32,
                        block: data,
                    }),
                )
                .await?;
            }
            Command::Cancel {
                piece,
                begin,
                length,
            } => {
                self.send_message(
                    wr,
                    Message::Cancel(Request {
                        index: piece as u32,
                        begin: begin as u32,
                        length: length as u32,
                    }),
                )
                .await?;
            }
            Command::Disconnect => (),
        }

        Ok(())
    }

    async fn send_handshake(&mut self, wr: &mut WriteHalf<'_>) -> Result<()> {
        let handshake = Handshake::new(&self.torrent.info_hash, &self.local_id);

        debug!("-> handshake");
        wr.write_all(&handshake.into_bytes()?).await?;

        self.state.is_handshake_sent.store(true, Ordering::Relaxed);

        Ok(())
    }

    async fn send_bitfield(&mut self, wr: &mut WriteHalf<'_>) -> Result<()> {
        let verified: Vec<bool> = (0..self.torrent.piece_count())
            .map(|piece| self.torrent.is_piece_verified.get(piece))
            .collect();

        debug!("-> bitfield ({} verified)", self.torrent.verified_piece_count());
        self.send_message(wr, Message::Bitfield(pack_bitfield(&verified)))
            .await
    }

    async fn send_message(&self, wr: &mut WriteHalf<'_>, message: Message) -> Result<()> {
        trace!("sending {:?}", discriminant(&message));
        wr.write_all(&message.into_bytes()).await?;
        Ok(())
    }

    async fn emit(&self, event: Event) -> Result<()> {
        self.event_tx
            .send(PeerEvent {
                addr: self.addr,
                event,
            })
            .await
            .map_err(|_| anyhow!("event consumer is gone"))
    }
}
