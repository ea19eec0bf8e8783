pub mod client;
pub mod config;
pub mod constants;
pub mod data_structures;
pub mod macros;
pub mod metainfo;
pub mod peer;
pub mod shutdown;
pub mod throttle;
pub mod torrent;
pub mod tracker;

use anyhow::Result;
use client::Client;
use data_structures::ID;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use torrent::Torrent;
use tracing::info;

const PEER_LIST_CHANNEL_CAPACITY: usize = 1 << 4;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = config::Config::new();
    let peer_id = ID::random_numeric();

    // a malformed torrent file is the one fatal input
    let metainfo = metainfo::from_file(&config.torrent)?;
    info!("{metainfo}");

    let trackers = metainfo.announce.clone();

    let (torrent, verified_rx) = Torrent::new(&metainfo, &config.download_dir)?;
    let torrent = Arc::new(torrent);

    torrent.check_existing_data().await;
    info!("{torrent}");

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let (peer_list_tx, peer_list_rx) = mpsc::channel(PEER_LIST_CHANNEL_CAPACITY);

    tracker::spawn_announcers(
        trackers,
        torrent.clone(),
        peer_id,
        config.port,
        peer_list_tx,
        shutdown_rx.clone(),
    );

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let client = Client::new(config.port, peer_id, torrent, verified_rx, peer_list_rx);
    tokio::spawn(client.run(listener, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    // resolves once the client and every announcer finished cleanup
    shutdown_tx.send().wait().await;

    Ok(())
}
