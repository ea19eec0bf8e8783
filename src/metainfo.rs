use crate::data_structures::{ID, ID_LEN};
use crate::ok_or_missing_field;
use anyhow::{anyhow, Context, Result};
use bendy::decoding::{FromBencode, Object};
use bendy::encoding::{AsString, SingleItemEncoder, ToBencode};
use std::fmt;

#[derive(Debug, Clone)]
pub struct MetaFile {
    pub path: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Single { length: u64 },
    Multi { files: Vec<MetaFile> },
}

#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<ID>,
    pub private: Option<bool>,
    pub mode: Mode,
}

#[derive(Debug)]
pub struct Metainfo {
    pub announce: Vec<String>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<u64>,
    pub encoding: Option<String>,
    pub info: Info,
}

pub fn from_file(path: &str) -> Result<Metainfo> {
    let buffer =
        std::fs::read(path).with_context(|| format!("failed to read torrent file {path}"))?;

    from_buffer(&buffer)
}

pub fn from_buffer(buffer: &[u8]) -> Result<Metainfo> {
    Metainfo::from_bencode(buffer).map_err(|e| anyhow!("malformed torrent file: {e}"))
}

impl Info {
    pub fn total_length(&self) -> u64 {
        match &self.mode {
            Mode::Single { length } => *length,
            Mode::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// SHA-1 of the canonical bencoding of the piece-layout metadata. The
    /// digest identifies the transfer to peers and trackers and depends on
    /// nothing outside this struct.
    pub fn hash(&self) -> Result<ID> {
        let bytes = self
            .to_bencode()
            .map_err(|e| anyhow!("failed to encode info dictionary: {e}"))?;

        Ok(ID::sha1(&bytes))
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut d| {
            match &self.mode {
                Mode::Multi { files } => d.emit_pair(b"files", files)?,
                Mode::Single { length } => d.emit_pair(b"length", *length)?,
            }

            d.emit_pair(b"name", &self.name)?;
            d.emit_pair(b"piece length", self.piece_length)?;

            let mut pieces = Vec::with_capacity(self.pieces.len() * ID_LEN);
            for piece_hash in &self.pieces {
                pieces.extend_from_slice(piece_hash.as_byte_ref());
            }
            d.emit_pair(b"pieces", AsString(pieces))?;

            if let Some(private) = self.private {
                d.emit_pair(b"private", u64::from(private))?;
            }

            Ok(())
        })
    }
}

impl ToBencode for MetaFile {
    const MAX_DEPTH: usize = 3;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut d| {
            d.emit_pair(b"length", self.length)?;
            d.emit_pair(b"path", &self.path)?;
            Ok(())
        })
    }
}

impl FromBencode for MetaFile {
    const EXPECTED_RECURSION_DEPTH: usize = 10;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut path = None;
        let mut length = None;

        let mut file = object.try_into_dictionary()?;
        while let Some(kv) = file.next_pair()? {
            match kv {
                (b"path", value) => {
                    path = Some(Vec::<String>::decode_bencode_object(value)?);
                }
                (b"length", value) => {
                    length = Some(u64::decode_bencode_object(value)?);
                }
                _ => (),
            }
        }

        Ok(MetaFile {
            path: ok_or_missing_field!(path)?,
            length: ok_or_missing_field!(length)?,
        })
    }
}

fn deserialize_pieces(raw: &[u8]) -> Result<Vec<ID>, bendy::decoding::Error> {
    if raw.is_empty() || raw.len() % ID_LEN > 0 {
        return Err(bendy::decoding::Error::missing_field(format!(
            "Info::pieces must be a sequence of 20-byte SHA-1 digests but has len={}",
            raw.len()
        )));
    }

    Ok(raw
        .chunks_exact(ID_LEN)
        .map(|chunk| ID::new(chunk.try_into().unwrap()))
        .collect())
}

impl FromBencode for Info {
    const EXPECTED_RECURSION_DEPTH: usize = 10;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;
        let mut private = None;
        let mut length = None;
        let mut files = None;

        let mut info = object.try_into_dictionary()?;
        while let Some(kv) = info.next_pair()? {
            match kv {
                (b"name", value) => {
                    name = Some(String::decode_bencode_object(value)?);
                }
                (b"piece length", value) => {
                    piece_length = Some(u64::decode_bencode_object(value)?);
                }
                (b"pieces", value) => {
                    let raw = AsString::decode_bencode_object(value)?.0;
                    pieces = Some(deserialize_pieces(&raw)?);
                }
                (b"private", value) => {
                    private = Some(u64::decode_bencode_object(value)? == 1);
                }
                (b"length", value) => {
                    length = Some(u64::decode_bencode_object(value)?);
                }
                (b"files", value) => {
                    files = Some(Vec::<MetaFile>::decode_bencode_object(value)?);
                }
                _ => (),
            }
        }

        let mode = match (length, files) {
            (Some(length), None) => Mode::Single { length },
            (None, Some(files)) => Mode::Multi { files },
            _ => {
                return Err(bendy::decoding::Error::missing_field(
                    "exactly one of length and files",
                ))
            }
        };

        Ok(Info {
            name: ok_or_missing_field!(name)?,
            piece_length: ok_or_missing_field!(piece_length)?,
            pieces: ok_or_missing_field!(pieces)?,
            private,
            mode,
        })
    }
}

impl FromBencode for Metainfo {
    const EXPECTED_RECURSION_DEPTH: usize = 10;

    fn decode_bencode_object(object: Object) -> Result<Self, bendy::decoding::Error> {
        let mut announce = Vec::new();
        let mut comment = None;
        let mut created_by = None;
        let mut creation_date = None;
        let mut encoding = None;
        let mut info = None;

        let mut torrent = object.try_into_dictionary()?;
        while let Some(kv) = torrent.next_pair()? {
            match kv {
                (b"announce", value) => {
                    let url = String::decode_bencode_object(value)?;
                    if url.starts_with("http") && !announce.contains(&url) {
                        announce.push(url);
                    }
                }
                (b"announce-list", value) => {
                    let tiers = Vec::<Vec<String>>::decode_bencode_object(value)?;
                    for tier in tiers {
                        for url in tier {
                            if url.starts_with("http") && !announce.contains(&url) {
                                announce.push(url);
                            }
                        }
                    }
                }
                (b"comment", value) => {
                    comment = Some(String::decode_bencode_object(value)?);
                }
                (b"created by", value) => {
                    created_by = Some(String::decode_bencode_object(value)?);
                }
                (b"creation date", value) => {
                    creation_date = Some(u64::decode_bencode_object(value)?);
                }
                (b"encoding", value) => {
                    encoding = Some(String::decode_bencode_object(value)?);
                }
                (b"info", value) => {
                    info = Some(Info::decode_bencode_object(value)?);
                }
                _ => (),
            }
        }

        Ok(Metainfo {
            announce,
            comment,
            created_by,
            creation_date,
            encoding,
            info: ok_or_missing_field!(info)?,
        })
    }
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut formatted_files = Vec::new();

        if let Mode::Multi { files } = &self.info.mode {
            for (i, file) in files.iter().enumerate() {
                formatted_files.push(format!(
                    "file_{} length:\t{}\tpath:\t{:?}\n",
                    i, file.length, file.path
                ));
            }
        }

        write!(
            f,
            "announce:\t{:?}\n\
            name:\t\t{}\n\
            comment:\t{:?}\n\
            created by:\t{:?}\n\
            creation date:\t{:?}\n\
            encoding:\t{:?}\n\
            piece length:\t{}\n\
            piece count:\t{}\n\
            total length:\t{}\n\
            {}",
            self.announce,
            self.info.name,
            self.comment,
            self.created_by,
            self.creation_date,
            self.encoding,
            self.info.piece_length,
            self.info.piece_count(),
            self.info.total_length(),
            formatted_files.join(""),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{from_buffer, Info, MetaFile, Mode};
    use crate::data_structures::ID;

    fn single_file_torrent_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d8:announce31:http://tracker.example/announce");
        bytes.extend_from_slice(b"7:comment4:test");
        bytes.extend_from_slice(b"4:infod6:lengthi1000e4:name8:file.bin12:piece lengthi512e");
        bytes.extend_from_slice(b"6:pieces40:");
        bytes.extend_from_slice(&[0xaa; 20]);
        bytes.extend_from_slice(&[0xbb; 20]);
        bytes.extend_from_slice(b"ee");
        bytes
    }

    #[test]
    fn single_file_parse() {
        let metainfo = from_buffer(&single_file_torrent_bytes()).unwrap();

        assert_eq!(
            metainfo.announce,
            vec!["http://tracker.example/announce".to_string()]
        );
        assert_eq!(metainfo.comment.as_deref(), Some("test"));
        assert_eq!(metainfo.info.name, "file.bin");
        assert_eq!(metainfo.info.piece_length, 512);
        assert_eq!(metainfo.info.piece_count(), 2);
        assert_eq!(metainfo.info.pieces[0], ID::new([0xaa; 20]));
        assert_eq!(metainfo.info.total_length(), 1000);
        assert!(matches!(metainfo.info.mode, Mode::Single { length: 1000 }));
    }

    #[test]
    fn multi_file_parse() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d8:announce31:http://tracker.example/announce");
        bytes.extend_from_slice(b"4:infod");
        bytes.extend_from_slice(b"5:filesl");
        bytes.extend_from_slice(b"d6:lengthi600e4:pathl3:sub5:a.bineed6:lengthi400e4:pathl5:b.bineee");
        bytes.extend_from_slice(b"4:name4:pack12:piece lengthi512e");
        bytes.extend_from_slice(b"6:pieces40:");
        bytes.extend_from_slice(&[0x11; 40]);
        bytes.extend_from_slice(b"7:privatei1e");
        bytes.extend_from_slice(b"ee");

        let metainfo = from_buffer(&bytes).unwrap();

        assert_eq!(metainfo.info.name, "pack");
        assert_eq!(metainfo.info.private, Some(true));
        assert_eq!(metainfo.info.total_length(), 1000);

        let Mode::Multi { files } = &metainfo.info.mode else {
            panic!("expected multi mode");
        };
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, vec!["sub".to_string(), "a.bin".to_string()]);
        assert_eq!(files[1].length, 400);
    }

    #[test]
    fn unsorted_keys_rejected() {
        // info before announce violates canonical key order
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"d4:infod6:lengthi1000e4:name8:file.bin12:piece lengthi512e");
        bytes.extend_from_slice(b"6:pieces40:");
        bytes.extend_from_slice(&[0xaa; 40]);
        bytes.extend_from_slice(b"e8:announce31:http://tracker.example/announcee");

        assert!(from_buffer(&bytes).is_err());
    }

    #[test]
    fn missing_info_rejected() {
        let bytes = b"d8:announce31:http://tracker.example/announcee";

        assert!(from_buffer(bytes).is_err());
    }

    fn make_info(private: Option<bool>) -> Info {
        Info {
            name: "pack".to_string(),
            piece_length: 512,
            pieces: vec![ID::new([0x11; 20]), ID::new([0x22; 20])],
            private,
            mode: Mode::Multi {
                files: vec![
                    MetaFile {
                        path: vec!["a.bin".to_string()],
                        length: 600,
                    },
                    MetaFile {
                        path: vec!["b.bin".to_string()],
                        length: 400,
                    },
                ],
            },
        }
    }

    #[test]
    fn info_hash_is_stable() {
        assert_eq!(
            make_info(None).hash().unwrap(),
            make_info(None).hash().unwrap()
        );
    }

    #[test]
    fn info_hash_covers_private_flag() {
        assert_ne!(
            make_info(None).hash().unwrap(),
            make_info(Some(true)).hash().unwrap()
        );
    }

    #[test]
    fn info_hash_matches_reparsed_metainfo() {
        let metainfo = from_buffer(&single_file_torrent_bytes()).unwrap();
        let reparsed = from_buffer(&single_file_torrent_bytes()).unwrap();

        assert_eq!(
            metainfo.info.hash().unwrap(),
            reparsed.info.hash().unwrap()
        );
    }
}
