mod announce;
mod response;

pub use announce::{Announce, AnnounceEvent};
pub use response::Response;

use crate::constants::{
    DEFAULT_ANNOUNCE_INTERVAL_SECS, FINAL_ANNOUNCE_TIMEOUT_SECS, TRACKER_TICK_SECS,
};
use crate::data_structures::ID;
use crate::shutdown;
use crate::torrent::Torrent;
use anyhow::{bail, Result};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, instrument, warn};

/// One announcer task per HTTP tracker. Peer lists land on `peer_list_tx`;
/// the orchestrator is the sole consumer.
pub fn spawn_announcers(
    trackers: Vec<String>,
    torrent: Arc<Torrent>,
    peer_id: ID,
    port: u16,
    peer_list_tx: mpsc::Sender<Vec<SocketAddrV4>>,
    shutdown_rx: shutdown::Receiver,
) {
    for tracker_url in trackers {
        let announcer = Announcer {
            tracker_url,
            torrent: torrent.clone(),
            peer_id,
            port,
            peer_list_tx: peer_list_tx.clone(),
            last_request: None,
            request_interval: Duration::from_secs(DEFAULT_ANNOUNCE_INTERVAL_SECS),
        };

        tokio::spawn(announcer.run(shutdown_rx.clone()));
    }
}

struct Announcer {
    tracker_url: String,
    torrent: Arc<Torrent>,
    peer_id: ID,
    port: u16,
    peer_list_tx: mpsc::Sender<Vec<SocketAddrV4>>,
    last_request: Option<Instant>,
    request_interval: Duration,
}

impl Announcer {
    #[instrument(skip_all, fields(tracker = %self.tracker_url))]
    async fn run(mut self, mut shutdown_rx: shutdown::Receiver) {
        let mut tick = interval(Duration::from_secs(TRACKER_TICK_SECS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = shutdown_rx.recv() => {
                    let deadline = Duration::from_secs(FINAL_ANNOUNCE_TIMEOUT_SECS);
                    match timeout(deadline, self.update(AnnounceEvent::Stopped)).await {
                        Ok(Err(e)) => warn!("final announce failed: {e:#}"),
                        Err(_) => warn!("final announce timed out"),
                        Ok(Ok(())) => (),
                    }
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.update(AnnounceEvent::Started).await {
                        warn!("announce failed: {e:#}");
                    }
                }
            }
        }
    }

    /// Periodic announce. A `Started` event inside the negotiated interval
    /// is a no-op; failures are logged by the caller and retried on the
    /// next tick that falls outside the interval.
    async fn update(&mut self, event: AnnounceEvent) -> Result<()> {
        if matches!(event, AnnounceEvent::Started)
            && self
                .last_request
                .is_some_and(|last| last.elapsed() < self.request_interval)
        {
            return Ok(());
        }

        self.last_request = Some(Instant::now());

        let announce = Announce {
            tracker_url: self.tracker_url.clone(),
            info_hash: self.torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: self.torrent.uploaded(),
            downloaded: self.torrent.downloaded(),
            left: self.torrent.left(),
            event,
        };

        let response = reqwest::get(announce.as_url()).await?;

        if !response.status().is_success() {
            bail!("tracker returned {}", response.status());
        }

        let body = response.bytes().await?;

        if matches!(event, AnnounceEvent::Stopped) {
            return Ok(());
        }

        let response = Response::from_bytes(&body)?;

        debug!(
            "announce ok: interval={}s, {} peers",
            response.interval,
            response.peers.len()
        );

        self.request_interval = Duration::from_secs(response.interval);

        // consumer gone means we are shutting down
        let _ = self.peer_list_tx.send(response.peers).await;

        Ok(())
    }
}
