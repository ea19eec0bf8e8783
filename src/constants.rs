pub const PSTRLEN: u8 = 19;
pub const PSTR: &str = "BitTorrent protocol";
pub const HANDSHAKE_LENGTH: usize = 68;

pub const BLOCK_SIZE: usize = 16384;

pub const MAX_LEECHERS: usize = 5;
pub const MAX_SEEDERS: usize = 5;

pub const MAX_UPLOAD_BYTES_PER_SEC: u64 = 16384;
pub const MAX_DOWNLOAD_BYTES_PER_SEC: u64 = 16384;
pub const THROTTLE_WINDOW_SECS: u64 = 1;

pub const PEER_TIMEOUT_SECS: u64 = 30;
pub const KEEP_ALIVE_MIN_INTERVAL_SECS: u64 = 30;

pub const SCHEDULER_TICK_SECS: u64 = 1;
pub const TRACKER_TICK_SECS: u64 = 10;
pub const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 30 * 60;
pub const FINAL_ANNOUNCE_TIMEOUT_SECS: u64 = 5;
