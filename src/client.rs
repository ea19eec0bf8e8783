use crate::constants::{
    MAX_DOWNLOAD_BYTES_PER_SEC, MAX_LEECHERS, MAX_SEEDERS, MAX_UPLOAD_BYTES_PER_SEC,
    PEER_TIMEOUT_SECS, SCHEDULER_TICK_SECS, THROTTLE_WINDOW_SECS,
};
use crate::data_structures::ID;
use crate::peer::{Command, DataPackage, DataRequest, Event, PeerEvent, PeerHandle};
use crate::shutdown;
use crate::throttle::Throttle;
use crate::torrent::Torrent;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1 << 6;

/// The control loop: owns every peer connection, the seeder/leecher
/// subsets, the block queues and both throttles. Single consumer of all
/// peer events, piece-verified notifications and tracker peer lists, so
/// scheduling always sees a consistent snapshot and the periodic passes
/// never overlap.
pub struct Client {
    port: u16,
    peer_id: ID,
    torrent: Arc<Torrent>,
    local_ip: Option<IpAddr>,

    peers: HashMap<SocketAddrV4, PeerHandle>,
    /// Peers we actively request data from.
    seeders: HashSet<SocketAddrV4>,
    /// Peers currently allowed to request data from us.
    leechers: HashSet<SocketAddrV4>,

    outgoing_blocks: VecDeque<DataRequest>,
    incoming_blocks: VecDeque<DataPackage>,

    upload_throttle: Throttle,
    download_throttle: Throttle,

    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: mpsc::Receiver<PeerEvent>,
    verified_rx: mpsc::UnboundedReceiver<usize>,
    peer_list_rx: mpsc::Receiver<Vec<SocketAddrV4>>,
}

impl Client {
    pub fn new(
        port: u16,
        peer_id: ID,
        torrent: Arc<Torrent>,
        verified_rx: mpsc::UnboundedReceiver<usize>,
        peer_list_rx: mpsc::Receiver<Vec<SocketAddrV4>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            port,
            peer_id,
            torrent,
            local_ip: local_ip_address::local_ip().ok(),
            peers: HashMap::new(),
            seeders: HashSet::new(),
            leechers: HashSet::new(),
            outgoing_blocks: VecDeque::new(),
            incoming_blocks: VecDeque::new(),
            upload_throttle: Throttle::new(
                MAX_UPLOAD_BYTES_PER_SEC,
                Duration::from_secs(THROTTLE_WINDOW_SECS),
            ),
            download_throttle: Throttle::new(
                MAX_DOWNLOAD_BYTES_PER_SEC,
                Duration::from_secs(THROTTLE_WINDOW_SECS),
            ),
            event_tx,
            event_rx,
            verified_rx,
            peer_list_rx,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(mut self, listener: TcpListener, mut shutdown_rx: shutdown::Receiver) {
        let mut peer_tick = interval(Duration::from_secs(SCHEDULER_TICK_SECS));
        let mut upload_tick = interval(Duration::from_secs(SCHEDULER_TICK_SECS));
        let mut download_tick = interval(Duration::from_secs(SCHEDULER_TICK_SECS));

        // a tick that fires while the previous pass still runs is dropped,
        // not queued
        for tick in [&mut peer_tick, &mut upload_tick, &mut download_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        info!("listening for peer connections on port {}", self.port);

        loop {
            select! {
                _ = shutdown_rx.recv() => break,
                Some(peer_event) = self.event_rx.recv() => {
                    self.handle_peer_event(peer_event).await;
                }
                Some(piece) = self.verified_rx.recv() => {
                    self.handle_piece_verified(piece);
                }
                Some(peer_list) = self.peer_list_rx.recv() => {
                    self.handle_peer_list(peer_list);
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.handle_inbound(stream, addr),
                        Err(e) => warn!("failed to accept connection: {e}"),
                    }
                }
                _ = peer_tick.tick() => self.process_peers(),
                _ = upload_tick.tick() => self.process_uploads().await,
                _ = download_tick.tick() => self.process_downloads().await,
            }
        }

        self.disconnect_all();
        info!("client stopped");
    }

    async fn handle_peer_event(&mut self, peer_event: PeerEvent) {
        let PeerEvent { addr, event } = peer_event;

        match event {
            Event::StateChanged => self.process_peers(),
            Event::Disconnected => {
                self.peers.remove(&addr);
                self.seeders.remove(&addr);
                self.leechers.remove(&addr);
                debug!("peer {addr} disconnected ({} connected)", self.peers.len());
            }
            Event::BlockRequested(request) => {
                self.outgoing_blocks.push_back(request);
                self.process_uploads().await;
            }
            Event::BlockCancelled(request) => {
                Self::mark_cancelled(&mut self.outgoing_blocks, &request);
                self.process_uploads().await;
            }
            Event::BlockReceived(package) => self.handle_block_received(package).await,
        }
    }

    /// A received block makes every other in-flight request for the same
    /// (piece, block) redundant; cancel them before queueing the write.
    async fn handle_block_received(&mut self, package: DataPackage) {
        if let Some(peer) = self.peers.get(&package.addr) {
            peer.state
                .is_block_requested
                .set(package.piece, package.block, false);
        }

        let block_length = self.torrent.block_length();
        for (addr, peer) in self.peers.iter() {
            if *addr == package.addr {
                continue;
            }
            if !peer.state.is_block_requested.get(package.piece, package.block) {
                continue;
            }

            peer.send(Command::Cancel {
                piece: package.piece,
                begin: package.block * block_length,
                length: block_length,
            });
            peer.state
                .is_block_requested
                .set(package.piece, package.block, false);
        }

        self.incoming_blocks.push_back(package);
        self.process_downloads().await;
    }

    fn mark_cancelled(queue: &mut VecDeque<DataRequest>, cancelled: &DataRequest) {
        for request in queue.iter_mut() {
            if request.addr == cancelled.addr
                && request.piece == cancelled.piece
                && request.begin == cancelled.begin
                && request.length == cancelled.length
            {
                request.is_cancelled = true;
            }
        }
    }

    fn handle_piece_verified(&mut self, piece: usize) {
        info!(
            "verified piece {piece} ({}/{})",
            self.torrent.verified_piece_count(),
            self.torrent.piece_count()
        );

        self.process_peers();

        for peer in self.peers.values() {
            if !peer.state.is_established() {
                continue;
            }
            peer.send(Command::Have(piece as u32));
        }

        if self.torrent.is_completed() {
            info!("download complete: {}", self.torrent);
        }
    }

    fn handle_peer_list(&mut self, peer_list: Vec<SocketAddrV4>) {
        for addr in peer_list {
            if self.is_own_address(&addr) || self.peers.contains_key(&addr) {
                continue;
            }

            debug!("connecting to peer {addr}");
            let handle = PeerHandle::connect(
                addr,
                self.torrent.clone(),
                self.peer_id,
                self.event_tx.clone(),
            );
            self.peers.insert(addr, handle);
        }

        info!("peer count: {}", self.peers.len());
    }

    fn is_own_address(&self, addr: &SocketAddrV4) -> bool {
        addr.port() == self.port && self.local_ip == Some(IpAddr::V4(*addr.ip()))
    }

    fn handle_inbound(&mut self, stream: TcpStream, addr: SocketAddr) {
        let SocketAddr::V4(addr) = addr else {
            debug!("ignoring non-ipv4 peer {addr}");
            return;
        };

        if self.peers.contains_key(&addr) {
            debug!("already connected to {addr}");
            return;
        }

        info!("accepted connection from {addr}");
        let handle = PeerHandle::accept(
            stream,
            addr,
            self.torrent.clone(),
            self.peer_id,
            self.event_tx.clone(),
        );
        self.peers.insert(addr, handle);
    }

    /// Peer lifecycle pass: most desirable peers first, drop the idle and
    /// the mutually complete, keep interest flags current, grant and
    /// reclaim leecher slots, admit seeders.
    fn process_peers(&mut self) {
        let timeout = Duration::from_secs(PEER_TIMEOUT_SECS);

        let mut ranked: Vec<SocketAddrV4> = self.peers.keys().copied().collect();
        ranked.sort_by_cached_key(|addr| {
            Reverse(
                self.peers[addr]
                    .state
                    .pieces_required_available(&self.torrent.is_piece_verified),
            )
        });

        for addr in ranked {
            let Some(peer) = self.peers.get(&addr) else {
                continue;
            };
            let state = peer.state.as_ref();

            if state.last_active().elapsed() > timeout {
                debug!("peer {addr} timed out");
                peer.send(Command::Disconnect);
                continue;
            }

            if !state.is_established() {
                continue;
            }

            if self.torrent.is_completed() {
                peer.send(Command::NotInterested);
            } else {
                peer.send(Command::Interested);
            }

            if state.is_completed(self.torrent.piece_count()) && self.torrent.is_completed() {
                debug!("both sides complete, dropping {addr}");
                peer.send(Command::Disconnect);
                continue;
            }

            peer.send(Command::KeepAlive);

            // leecher lost interest, reclaim its slot
            if !state.is_interested_received.load(Ordering::Relaxed)
                && !state.is_choke_sent.load(Ordering::Relaxed)
            {
                peer.send(Command::Choke);
                self.leechers.remove(&addr);
            }

            if self.leechers.len() < MAX_LEECHERS
                && state.is_interested_received.load(Ordering::Relaxed)
                && state.is_choke_sent.load(Ordering::Relaxed)
            {
                peer.send(Command::Unchoke);
                self.leechers.insert(addr);
            }

            if self.seeders.len() < MAX_SEEDERS
                && !state.is_choke_received.load(Ordering::Relaxed)
            {
                self.seeders.insert(addr);
            }
        }
    }

    /// Drains pending block requests under the upload throttle. Cancelled
    /// requests, unverified pieces and data missing on disk are skipped
    /// without charging the throttle.
    async fn process_uploads(&mut self) {
        while !self.upload_throttle.is_throttled() {
            let Some(request) = self.outgoing_blocks.pop_front() else {
                break;
            };

            if request.is_cancelled {
                continue;
            }

            if !self.torrent.is_piece_verified.get(request.piece) {
                continue;
            }

            let Some(peer) = self.peers.get(&request.addr) else {
                continue;
            };

            match self
                .torrent
                .read_block(request.piece, request.begin, request.length)
                .await
            {
                Ok(Some(data)) => {
                    peer.send(Command::Piece {
                        piece: request.piece,
                        begin: request.begin,
                        data: data.into(),
                    });
                    self.upload_throttle.add(request.length as u64);
                    self.torrent.add_uploaded(request.length as u64);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("failed to read block for upload: {e:#}");
                    continue;
                }
            }
        }
    }

    /// Drains received blocks into the store, then schedules new requests:
    /// pieces ranked by completion + rarity + jitter, seeders in random
    /// order, blocks strictly in index order, one in-flight request per
    /// peer and per block across the swarm.
    async fn process_downloads(&mut self) {
        while let Some(package) = self.incoming_blocks.pop_front() {
            if let Err(e) = self
                .torrent
                .write_block(package.piece, package.block, &package.data)
                .await
            {
                warn!("failed to write block: {e:#}");
            }
        }

        if self.torrent.is_completed() {
            return;
        }

        for piece in self.ranked_pieces() {
            if self.torrent.is_piece_verified.get(piece) {
                continue;
            }

            for addr in self.shuffled_seeders() {
                let Some(peer) = self.peers.get(&addr) else {
                    continue;
                };

                if !peer.state.is_piece_downloaded.get(piece) {
                    continue;
                }

                for block in 0..self.torrent.block_count(piece) {
                    if self.download_throttle.is_throttled() {
                        continue;
                    }

                    if self.torrent.is_block_acquired.get(piece, block) {
                        continue;
                    }

                    // one in-flight request per peer
                    if peer.state.blocks_requested() > 0 {
                        continue;
                    }

                    // one in-flight request per block across the swarm
                    if self
                        .peers
                        .values()
                        .any(|p| p.state.is_block_requested.get(piece, block))
                    {
                        continue;
                    }

                    let length = self.torrent.block_size(piece, block);
                    peer.send(Command::Request {
                        piece,
                        begin: block * self.torrent.block_length(),
                        length,
                    });
                    self.download_throttle.add(length as u64);
                    peer.state.is_block_requested.set(piece, block, true);
                }
            }
        }
    }

    fn ranked_pieces(&self) -> Vec<usize> {
        let piece_count = self.torrent.piece_count();
        let mut rng = thread_rng();

        let scores: Vec<f64> = (0..piece_count)
            .map(|piece| self.piece_score(piece, &mut rng))
            .collect();

        let mut indexes: Vec<usize> = (0..piece_count).collect();
        indexes.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));

        indexes
    }

    fn piece_score(&self, piece: usize, rng: &mut impl Rng) -> f64 {
        let mut progress = self.torrent.is_block_acquired.piece_progress(piece);
        if progress == 1.0 {
            // fully acquired pieces are waiting on verification, not data
            progress = 0.0;
        }

        progress + self.piece_rarity(piece) + scheduling_jitter(rng)
    }

    fn piece_rarity(&self, piece: usize) -> f64 {
        if self.seeders.is_empty() {
            return 0.0;
        }

        let lacking = self
            .seeders
            .iter()
            .filter(|addr| match self.peers.get(*addr) {
                Some(peer) => !peer.state.is_piece_downloaded.get(piece),
                None => false,
            })
            .count();

        lacking as f64 / self.seeders.len() as f64
    }

    fn shuffled_seeders(&self) -> Vec<SocketAddrV4> {
        let mut seeders: Vec<SocketAddrV4> = self.seeders.iter().copied().collect();
        seeders.shuffle(&mut thread_rng());
        seeders
    }

    fn disconnect_all(&mut self) {
        info!("disconnecting {} peers", self.peers.len());

        for peer in self.peers.values() {
            peer.send(Command::Disconnect);
        }

        self.peers.clear();
        self.seeders.clear();
        self.leechers.clear();
    }
}

/// Tie-break noise for piece ranking. Stays well under any real score
/// difference: completion and rarity move in steps of at least one block
/// or one seeder.
fn scheduling_jitter(rng: &mut impl Rng) -> f64 {
    rng.gen_range(0..100) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::{scheduling_jitter, Client};
    use crate::peer::DataRequest;
    use rand::thread_rng;
    use std::collections::VecDeque;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn jitter_is_bounded() {
        let mut rng = thread_rng();

        for _ in 0..10_000 {
            let jitter = scheduling_jitter(&mut rng);
            assert!((0.0..0.1).contains(&jitter));
        }
    }

    fn request(addr: SocketAddrV4, piece: usize, begin: usize) -> DataRequest {
        DataRequest {
            addr,
            piece,
            begin,
            length: 16384,
            is_cancelled: false,
        }
    }

    #[test]
    fn cancel_marks_only_matching_requests() {
        let peer_a = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881);
        let peer_b = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 6881);

        let mut queue: VecDeque<DataRequest> = VecDeque::from([
            request(peer_a, 3, 0),
            request(peer_a, 3, 16384),
            request(peer_b, 3, 0),
        ]);

        Client::mark_cancelled(&mut queue, &request(peer_a, 3, 0));

        assert!(queue[0].is_cancelled);
        assert!(!queue[1].is_cancelled);
        assert!(!queue[2].is_cancelled);
    }
}
