use crate::ok_or_missing_field;
use anyhow::{anyhow, bail, Result};
use bendy::decoding::{Decoder, FromBencode, Object};
use bendy::encoding::AsString;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::warn;

pub const COMPACT_PEER_LEN: usize = 6;

/// Decoded announce response: the re-announce interval and the compact
/// peer list (4 address bytes + 2 big-endian port bytes per peer).
#[derive(Debug, Clone)]
pub struct Response {
    pub warning_message: Option<String>,
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<SocketAddrV4>,
}

impl Response {
    pub fn from_bytes(bytes: &[u8]) -> Result<Response> {
        let mut decoder = Decoder::new(bytes);
        let object = decoder
            .next_object()
            .map_err(|e| anyhow!("tracker response is not bencoded: {e}"))?;

        match object {
            Some(object) => Response::decode_bencode_object(object)
                .map_err(|e| anyhow!("unexpected tracker response shape: {e}")),
            None => bail!("empty tracker response"),
        }
    }
}

pub fn socketaddr_from_compact_bytes(chunk: &[u8]) -> Result<SocketAddrV4> {
    match chunk {
        [a, b, c, d, port_high, port_low] => Ok(SocketAddrV4::new(
            Ipv4Addr::new(*a, *b, *c, *d),
            u16::from_be_bytes([*port_high, *port_low]),
        )),
        _ => bail!(
            "compact peer must be {COMPACT_PEER_LEN} bytes, got {}",
            chunk.len()
        ),
    }
}

impl FromBencode for Response {
    const EXPECTED_RECURSION_DEPTH: usize = 2;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut warning_message = None;
        let mut interval = None;
        let mut min_interval = None;
        let mut complete = None;
        let mut incomplete = None;
        let mut peers = None;

        let mut response = object.try_into_dictionary()?;
        while let Some(kv) = response.next_pair()? {
            match kv {
                (b"warning message", value) => {
                    warning_message = Some(String::decode_bencode_object(value)?);
                }
                (b"interval", value) => {
                    interval = Some(u64::decode_bencode_object(value)?);
                }
                (b"min interval", value) => {
                    min_interval = Some(u64::decode_bencode_object(value)?);
                }
                (b"complete", value) => {
                    complete = Some(u64::decode_bencode_object(value)?);
                }
                (b"incomplete", value) => {
                    incomplete = Some(u64::decode_bencode_object(value)?);
                }
                (b"peers", value) => {
                    let peer_bytes = AsString::decode_bencode_object(value)?.0;

                    peers = Some(
                        peer_bytes
                            .chunks_exact(COMPACT_PEER_LEN)
                            .filter_map(|chunk| match socketaddr_from_compact_bytes(chunk) {
                                Ok(peer_addr) => Some(peer_addr),
                                Err(e) => {
                                    warn!(?e);
                                    None
                                }
                            })
                            .collect(),
                    );
                }
                _ => (),
            }
        }

        Ok(Response {
            warning_message,
            interval: ok_or_missing_field!(interval)?,
            min_interval,
            complete,
            incomplete,
            peers: ok_or_missing_field!(peers)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{socketaddr_from_compact_bytes, Response};
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn parse_response() {
        let bytes = vec![
            0x64, 0x38, 0x3a, 0x63, 0x6f, 0x6d, 0x70, 0x6c, 0x65, 0x74, 0x65, 0x69, 0x35, 0x65,
            0x31, 0x30, 0x3a, 0x64, 0x6f, 0x77, 0x6e, 0x6c, 0x6f, 0x61, 0x64, 0x65, 0x64, 0x69,
            0x35, 0x33, 0x65, 0x31, 0x30, 0x3a, 0x69, 0x6e, 0x63, 0x6f, 0x6d, 0x70, 0x6c, 0x65,
            0x74, 0x65, 0x69, 0x31, 0x65, 0x38, 0x3a, 0x69, 0x6e, 0x74, 0x65, 0x72, 0x76, 0x61,
            0x6c, 0x69, 0x31, 0x39, 0x31, 0x34, 0x65, 0x31, 0x32, 0x3a, 0x6d, 0x69, 0x6e, 0x20,
            0x69, 0x6e, 0x74, 0x65, 0x72, 0x76, 0x61, 0x6c, 0x69, 0x39, 0x35, 0x37, 0x65, 0x35,
            0x3a, 0x70, 0x65, 0x65, 0x72, 0x73, 0x33, 0x36, 0x3a, 0x9f, 0x45, 0x41, 0x9d, 0x1a,
            0xe7, 0x9f, 0x45, 0x41, 0x9d, 0xfe, 0x72, 0x9f, 0x45, 0x41, 0x9d, 0xc8, 0x70, 0x9f,
            0x45, 0x41, 0x9d, 0xab, 0x24, 0x9f, 0x45, 0x41, 0x9d, 0x4c, 0xb7, 0x9f, 0x45, 0x41,
            0x9d, 0x37, 0x02, 0x65,
        ];

        let response = Response::from_bytes(&bytes).unwrap();

        assert_eq!(response.warning_message, None);
        assert_eq!(response.interval, 1914);
        assert_eq!(response.min_interval, Some(957));
        assert_eq!(response.complete, Some(5));
        assert_eq!(response.incomplete, Some(1));

        let expected_ip = Ipv4Addr::new(0x9f, 0x45, 0x41, 0x9d);
        let expected_ports = [6887, 65138, 51312, 43812, 19639, 14082];

        assert_eq!(response.peers.len(), expected_ports.len());
        for (peer, port) in response.peers.iter().zip(expected_ports) {
            assert_eq!(*peer, SocketAddrV4::new(expected_ip, port));
        }
    }

    #[test]
    fn missing_interval_rejected() {
        // d5:peers0:e
        let bytes = b"d5:peers0:e";

        assert!(Response::from_bytes(bytes).is_err());
    }

    #[test]
    fn compact_chunk_decodes() {
        let addr = socketaddr_from_compact_bytes(&[10, 0, 0, 1, 0x1a, 0xe1]).unwrap();

        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881));
        assert!(socketaddr_from_compact_bytes(&[10, 0, 0, 1]).is_err());
    }
}
