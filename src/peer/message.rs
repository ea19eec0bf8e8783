use anyhow::{bail, ensure, Result};
use bincode::Options;
use bytes::Bytes;
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};

pub const BYTES_IN_LEN_PREFIX: usize = 4;

const CHOKE_ID: u8 = 0;
const UNCHOKE_ID: u8 = 1;
const INTERESTED_ID: u8 = 2;
const NOT_INTERESTED_ID: u8 = 3;
const HAVE_ID: u8 = 4;
const BITFIELD_ID: u8 = 5;
const REQUEST_ID: u8 = 6;
const PIECE_ID: u8 = 7;
const CANCEL_ID: u8 = 8;
const PORT_ID: u8 = 9;

const STATE_LEN: u32 = 1;
const HAVE_LEN: u32 = 5;
const BITFIELD_BASE_LEN: u32 = 1;
const REQUEST_LEN: u32 = 13;
const PIECE_BASE_LEN: u32 = 9;
const CANCEL_LEN: u32 = 13;
const PORT_LEN: u32 = 3;

/// One framed wire message, without the handshake (which has its own fixed
/// layout, see `handshake`). All multi-byte integers are big-endian.
#[derive(Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(Request),
    Piece(Piece),
    Cancel(Request),
    Port(u16),
}

#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Piece {
    pub index: u32,
    pub begin: u32,
    pub block: Bytes,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
}

impl Message {
    /// Payload length announced by a frame's 4-byte prefix.
    pub fn announced_len(buf: &[u8]) -> usize {
        read_u32(buf, 0) as usize
    }

    /// Decodes exactly one complete frame (length prefix included). A
    /// frame whose length field contradicts its type, or whose type id is
    /// unknown, is a protocol violation.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        ensure!(
            frame.len() >= BYTES_IN_LEN_PREFIX,
            "frame shorter than its length prefix"
        );

        let len = Self::announced_len(frame);
        ensure!(
            frame.len() == BYTES_IN_LEN_PREFIX + len,
            "frame is {} bytes but announces {}",
            frame.len(),
            BYTES_IN_LEN_PREFIX + len
        );

        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        let id = frame[4];
        let len = len as u32;

        let message = match id {
            CHOKE_ID => Self::state_message(len, Message::Choke)?,
            UNCHOKE_ID => Self::state_message(len, Message::Unchoke)?,
            INTERESTED_ID => Self::state_message(len, Message::Interested)?,
            NOT_INTERESTED_ID => Self::state_message(len, Message::NotInterested)?,
            HAVE_ID => {
                ensure!(len == HAVE_LEN, "have message with length {len}");
                Message::Have(read_u32(frame, 5))
            }
            BITFIELD_ID => Message::Bitfield(Bytes::copy_from_slice(&frame[5..])),
            REQUEST_ID => {
                ensure!(len == REQUEST_LEN, "request message with length {len}");
                Message::Request(Request {
                    index: read_u32(frame, 5),
                    begin: read_u32(frame, 9),
                    length: read_u32(frame, 13),
                })
            }
            PIECE_ID => {
                ensure!(len >= PIECE_BASE_LEN, "piece message with length {len}");
                Message::Piece(Piece {
                    index: read_u32(frame, 5),
                    begin: read_u32(frame, 9),
                    block: Bytes::copy_from_slice(&frame[13..]),
                })
            }
            CANCEL_ID => {
                ensure!(len == CANCEL_LEN, "cancel message with length {len}");
                Message::Cancel(Request {
                    index: read_u32(frame, 5),
                    begin: read_u32(frame, 9),
                    length: read_u32(frame, 13),
                })
            }
            PORT_ID => {
                ensure!(len == PORT_LEN, "port message with length {len}");
                Message::Port(((frame[5] as u16) << 8) + frame[6] as u16)
            }
            unsupported => bail!("unsupported message id {unsupported}"),
        };

        Ok(message)
    }

    fn state_message(len: u32, message: Message) -> Result<Message> {
        ensure!(len == STATE_LEN, "{message:?} message with length {len}");
        Ok(message)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        bincode::DefaultOptions::new()
            .with_big_endian()
            .with_fixint_encoding()
            .serialize(&self)
            .unwrap()
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Message::KeepAlive => serializer.serialize_u32(0),
            Message::Choke => serialize_state(serializer, CHOKE_ID),
            Message::Unchoke => serialize_state(serializer, UNCHOKE_ID),
            Message::Interested => serialize_state(serializer, INTERESTED_ID),
            Message::NotInterested => serialize_state(serializer, NOT_INTERESTED_ID),
            Message::Have(piece_index) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&HAVE_LEN)?;
                tup.serialize_element(&HAVE_ID)?;
                tup.serialize_element(piece_index)?;
                tup.end()
            }
            Message::Bitfield(bitfield) => {
                let mut tup = serializer.serialize_tuple(bitfield.len() + 2)?;
                tup.serialize_element(&(BITFIELD_BASE_LEN + bitfield.len() as u32))?;
                tup.serialize_element(&BITFIELD_ID)?;
                for byte in bitfield.iter() {
                    tup.serialize_element(byte)?;
                }
                tup.end()
            }
            Message::Request(request) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&REQUEST_LEN)?;
                tup.serialize_element(&REQUEST_ID)?;
                tup.serialize_element(request)?;
                tup.end()
            }
            Message::Piece(piece) => {
                let mut tup = serializer.serialize_tuple(piece.block.len() + 4)?;
                tup.serialize_element(&(PIECE_BASE_LEN + piece.block.len() as u32))?;
                tup.serialize_element(&PIECE_ID)?;
                tup.serialize_element(&piece.index)?;
                tup.serialize_element(&piece.begin)?;
                for byte in piece.block.iter() {
                    tup.serialize_element(byte)?;
                }
                tup.end()
            }
            Message::Cancel(request) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&CANCEL_LEN)?;
                tup.serialize_element(&CANCEL_ID)?;
                tup.serialize_element(request)?;
                tup.end()
            }
            Message::Port(listen_port) => {
                let mut tup = serializer.serialize_tuple(3)?;
                tup.serialize_element(&PORT_LEN)?;
                tup.serialize_element(&PORT_ID)?;
                tup.serialize_element(listen_port)?;
                tup.end()
            }
        }
    }
}

fn serialize_state<S>(serializer: S, id: u8) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut tup = serializer.serialize_tuple(2)?;
    tup.serialize_element(&STATE_LEN)?;
    tup.serialize_element(&id)?;
    tup.end()
}

/// Packs per-piece flags into the wire bitfield layout: bytes are filled
/// from the END of the field, MSB-first within each byte, so piece i lives
/// in byte `n_bytes - 1 - i / 8` under mask `0x80 >> (i % 8)`.
pub fn pack_bitfield(pieces: &[bool]) -> Bytes {
    let n_bytes = crate::unsigned_ceil_div!(pieces.len().max(1), 8);
    let mut bytes = vec![0u8; n_bytes];

    for (i, has) in pieces.iter().enumerate() {
        if *has {
            bytes[n_bytes - 1 - i / 8] |= 0b1000_0000 >> (i % 8);
        }
    }

    Bytes::from(bytes)
}

/// Inverse of `pack_bitfield`. `None` when the byte count does not match
/// the piece count.
pub fn unpack_bitfield(bytes: &[u8], piece_count: usize) -> Option<Vec<bool>> {
    let n_bytes = crate::unsigned_ceil_div!(piece_count.max(1), 8);

    if bytes.len() != n_bytes {
        return None;
    }

    Some(
        (0..piece_count)
            .map(|i| bytes[n_bytes - 1 - i / 8] & (0b1000_0000 >> (i % 8)) > 0)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::{pack_bitfield, unpack_bitfield, Message, Piece, Request};
    use bytes::Bytes;

    fn test_message_ser_de(raw_message: &[u8], expected_message: Message) {
        let message = Message::from_frame(raw_message).unwrap();

        assert_eq!(expected_message, message);

        let bytes = message.into_bytes();

        assert_eq!(raw_message, &bytes);
    }

    #[test]
    fn keep_alive() {
        test_message_ser_de(&[0, 0, 0, 0], Message::KeepAlive);
    }

    #[test]
    fn choke() {
        test_message_ser_de(&[0, 0, 0, 1, 0], Message::Choke);
    }

    #[test]
    fn unchoke() {
        test_message_ser_de(&[0, 0, 0, 1, 1], Message::Unchoke);
    }

    #[test]
    fn interested() {
        test_message_ser_de(&[0, 0, 0, 1, 2], Message::Interested);
    }

    #[test]
    fn not_interested() {
        test_message_ser_de(&[0, 0, 0, 1, 3], Message::NotInterested);
    }

    #[test]
    fn have() {
        let piece_index: u32 = 726049813;

        let mut raw_message = [0, 0, 0, 5, 4, 0, 0, 0, 0];
        raw_message[5..9].copy_from_slice(&piece_index.to_be_bytes());

        test_message_ser_de(&raw_message, Message::Have(piece_index));
    }

    #[test]
    fn bitfield() {
        let raw_message = [0, 0, 0, 8, 5, 23, 113, 254, 203, 0, 17, 224];

        let bitfield = Bytes::copy_from_slice(&raw_message[5..]);

        test_message_ser_de(&raw_message, Message::Bitfield(bitfield));
    }

    #[test]
    fn request() {
        let index: u32 = 726049813;
        let begin: u32 = 3456;
        let length: u32 = 11166679;

        let mut raw_message = [0, 0, 0, 13, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        raw_message[5..9].copy_from_slice(&index.to_be_bytes());
        raw_message[9..13].copy_from_slice(&begin.to_be_bytes());
        raw_message[13..17].copy_from_slice(&length.to_be_bytes());

        test_message_ser_de(
            &raw_message,
            Message::Request(Request {
                index,
                begin,
                length,
            }),
        );
    }

    #[test]
    fn piece() {
        let index: u32 = 726049813;
        let begin: u32 = 3456;

        let mut raw_message = [
            0, 0, 0, 20, 7, 0, 0, 0, 0, 0, 0, 0, 0, 247, 251, 239, 152, 196, 66, 34, 33, 90, 29,
            97,
        ];
        raw_message[5..9].copy_from_slice(&index.to_be_bytes());
        raw_message[9..13].copy_from_slice(&begin.to_be_bytes());

        let block = Bytes::copy_from_slice(&raw_message[13..]);

        test_message_ser_de(
            &raw_message,
            Message::Piece(Piece {
                index,
                begin,
                block,
            }),
        );
    }

    #[test]
    fn cancel() {
        let index: u32 = 726049813;
        let begin: u32 = 3456;
        let length: u32 = 11166679;

        let mut raw_message = [0, 0, 0, 13, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        raw_message[5..9].copy_from_slice(&index.to_be_bytes());
        raw_message[9..13].copy_from_slice(&begin.to_be_bytes());
        raw_message[13..17].copy_from_slice(&length.to_be_bytes());

        test_message_ser_de(
            &raw_message,
            Message::Cancel(Request {
                index,
                begin,
                length,
            }),
        );
    }

    #[test]
    fn port() {
        let listen_port = 45678u16;
        let left = (listen_port >> 8) as u8;
        let right = (listen_port % (1 << 8)) as u8;

        test_message_ser_de(&[0, 0, 0, 3, 9, left, right], Message::Port(listen_port));
    }

    #[test]
    fn truncated_frame_rejected() {
        let raw_message = [0, 0, 0, 69, 7, 1, 2, 3, 4, 5, 6, 7, 8];

        assert!(Message::from_frame(&raw_message).is_err());
    }

    #[test]
    fn wrong_state_length_rejected() {
        // choke must announce exactly one payload byte
        assert!(Message::from_frame(&[0, 0, 0, 2, 0, 0]).is_err());
    }

    #[test]
    fn wrong_have_length_rejected() {
        assert!(Message::from_frame(&[0, 0, 0, 3, 4, 0, 0]).is_err());
    }

    #[test]
    fn unknown_id_rejected() {
        assert!(Message::from_frame(&[0, 0, 0, 1, 17]).is_err());
    }

    #[test]
    fn bitfield_layout_is_reversed() {
        let mut pieces = vec![false; 10];
        pieces[0] = true;
        pieces[1] = true;
        pieces[9] = true;

        let bytes = pack_bitfield(&pieces);

        // piece 0 and 1 land in the LAST byte, MSB-first; piece 9 in the first
        assert_eq!(&[0x40, 0xc0][..], &bytes);

        assert_eq!(Some(pieces), unpack_bitfield(&bytes, 10));
    }

    #[test]
    fn bitfield_length_mismatch_rejected() {
        assert_eq!(None, unpack_bitfield(&[0, 0, 0], 10));
        assert_eq!(None, unpack_bitfield(&[0], 10));
    }

    #[test]
    fn bitfield_roundtrip() {
        let pieces: Vec<bool> = (0..23).map(|i| i % 3 == 0).collect();

        let packed = pack_bitfield(&pieces);
        assert_eq!(3, packed.len());
        assert_eq!(Some(pieces), unpack_bitfield(&packed, 23));
    }
}
