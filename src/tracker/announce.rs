use crate::data_structures::ID;

#[derive(Debug, Clone, Copy)]
pub enum AnnounceEvent {
    Started,
    Paused,
    Stopped,
}

/// One announce request. Serialized straight into the query string; the
/// two 20-byte ids are percent-encoded raw bytes.
#[derive(Debug)]
pub struct Announce {
    pub tracker_url: String,
    pub info_hash: ID,
    pub peer_id: ID,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

impl Announce {
    pub fn as_url(&self) -> String {
        let mut s = self.tracker_url.clone();

        s.push_str("?info_hash=");
        s.push_str(urlencoding::encode_binary(self.info_hash.as_byte_ref()).as_ref());

        s.push_str("&peer_id=");
        s.push_str(urlencoding::encode_binary(self.peer_id.as_byte_ref()).as_ref());

        s.push_str("&port=");
        s.push_str(&self.port.to_string());

        s.push_str("&uploaded=");
        s.push_str(&self.uploaded.to_string());

        s.push_str("&downloaded=");
        s.push_str(&self.downloaded.to_string());

        s.push_str("&left=");
        s.push_str(&self.left.to_string());

        s.push_str("&compact=1");

        s.push_str("&event=");
        s.push_str(match self.event {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Paused => "paused",
            AnnounceEvent::Stopped => "stopped",
        });

        s
    }
}

#[cfg(test)]
mod tests {
    use super::{Announce, AnnounceEvent};
    use crate::data_structures::{ID, ID_LEN};

    const TRACKER_URL: &str = "http://example.com/announce";
    const INFO_HASH: [u8; ID_LEN] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0];
    const PEER_ID: [u8; ID_LEN] = [
        11, 22, 33, 44, 55, 66, 77, 88, 99, 0, 11, 22, 33, 44, 55, 66, 77, 88, 99, 0,
    ];
    const ENCODED_URL: &str = "http://example.com/announce?info_hash=%01%02%03%04%05%06%07%08%09%00%01%02%03%04%05%06%07%08%09%00&peer_id=%0B%16%21%2C7BMXc%00%0B%16%21%2C7BMXc%00&port=6887&uploaded=776241&downloaded=277518&left=78907&compact=1&event=started";

    #[test]
    fn announce_as_url() {
        let announce = Announce {
            tracker_url: TRACKER_URL.to_string(),
            info_hash: ID::new(INFO_HASH),
            peer_id: ID::new(PEER_ID),
            port: 6887,
            uploaded: 776241,
            downloaded: 277518,
            left: 78907,
            event: AnnounceEvent::Started,
        };

        assert_eq!(announce.as_url(), ENCODED_URL);
    }

    #[test]
    fn stopped_event_name() {
        let announce = Announce {
            tracker_url: TRACKER_URL.to_string(),
            info_hash: ID::new(INFO_HASH),
            peer_id: ID::new(PEER_ID),
            port: 6887,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: AnnounceEvent::Stopped,
        };

        assert!(announce.as_url().ends_with("&event=stopped"));
    }
}
