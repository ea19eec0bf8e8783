use crate::constants::{HANDSHAKE_LENGTH, PSTR, PSTRLEN};
use crate::data_structures::{ID, ID_LEN};
use anyhow::{anyhow, ensure, Result};
use bincode::Options;
use core::fmt;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize};

/// The fixed 68-byte opening message: protocol name length, protocol name,
/// 8 reserved bytes, infohash, peer id.
#[derive(Serialize, Deserialize, Debug)]
pub struct Handshake {
    pstrlen: u8,
    pstr: Pstr,
    reserved: [u8; 8],
    info_hash: [u8; ID_LEN],
    peer_id: [u8; ID_LEN],
}

impl Handshake {
    pub fn new(info_hash: &ID, peer_id: &ID) -> Handshake {
        Handshake {
            pstrlen: PSTRLEN,
            pstr: Pstr(PSTR.to_string()),
            reserved: [0; 8],
            info_hash: info_hash.as_byte_ref().try_into().unwrap(),
            peer_id: peer_id.as_byte_ref().try_into().unwrap(),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Handshake> {
        ensure!(
            buf.len() == HANDSHAKE_LENGTH,
            "handshake must be exactly {HANDSHAKE_LENGTH} bytes, got {}",
            buf.len()
        );

        let handshake: Handshake = bincode::DefaultOptions::new()
            .with_big_endian()
            .with_fixint_encoding()
            .deserialize(buf)
            .map_err(|e| anyhow!("undecodable handshake: {e}"))?;

        ensure!(
            handshake.pstrlen == PSTRLEN && handshake.pstr.0 == PSTR,
            "handshake protocol must be {PSTR:?}"
        );

        Ok(handshake)
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        Ok(bincode::DefaultOptions::new()
            .with_big_endian()
            .with_fixint_encoding()
            .serialize(&self)?)
    }

    pub fn info_hash(&self) -> ID {
        ID::new(self.info_hash)
    }

    pub fn peer_id(&self) -> ID {
        ID::new(self.peer_id)
    }
}

#[derive(Debug)]
pub struct Pstr(String);

impl Serialize for Pstr {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut tuple = s.serialize_tuple(PSTRLEN as usize)?;
        for byte in self.0.as_bytes().iter() {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Pstr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PstrVisitor;

        impl<'de> Visitor<'de> for PstrVisitor {
            type Value = Pstr;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 19-byte protocol name")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut name = String::with_capacity(PSTRLEN as usize);

                for _ in 0..PSTRLEN {
                    name.push(
                        seq.next_element()?
                            .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?,
                    );
                }

                Ok(Pstr(name))
            }
        }

        deserializer.deserialize_tuple(PSTRLEN as usize, PstrVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::Handshake;
    use crate::constants::HANDSHAKE_LENGTH;
    use crate::data_structures::ID;

    const INFO_HASH: [u8; 20] = [
        0x55, 0x52, 0x08, 0x7e, 0xc1, 0x98, 0x40, 0xac, 0xe8, 0x79, 0x5a, 0xf9, 0x3e, 0x13, 0x7d,
        0x2b, 0xd7, 0x14, 0x50, 0xd7,
    ];
    const PEER_ID: &[u8; 20] = b"01234567890123456789";

    fn expected_bytes() -> Vec<u8> {
        let mut bytes = vec![19u8];
        bytes.extend_from_slice(b"BitTorrent protocol");
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&INFO_HASH);
        bytes.extend_from_slice(PEER_ID);
        bytes
    }

    #[test]
    fn encodes_to_exact_layout() {
        let handshake = Handshake::new(&ID::new(INFO_HASH), &ID::new(*PEER_ID));

        let bytes = handshake.into_bytes().unwrap();

        assert_eq!(HANDSHAKE_LENGTH, bytes.len());
        assert_eq!(expected_bytes(), bytes);
    }

    #[test]
    fn decodes_own_encoding() {
        let handshake = Handshake::from_bytes(&expected_bytes()).unwrap();

        assert_eq!(ID::new(INFO_HASH), handshake.info_hash());
        assert_eq!(ID::new(*PEER_ID), handshake.peer_id());
    }

    #[test]
    fn altered_info_hash_is_detected() {
        let expected = ID::new(INFO_HASH);

        for i in 0..20 {
            let mut bytes = expected_bytes();
            bytes[28 + i] ^= 0x01;

            let handshake = Handshake::from_bytes(&bytes).unwrap();
            assert_ne!(expected, handshake.info_hash());
        }
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(Handshake::from_bytes(&expected_bytes()[..67]).is_err());
    }

    #[test]
    fn wrong_protocol_name_rejected() {
        let mut bytes = expected_bytes();
        bytes[1] = b'b';

        assert!(Handshake::from_bytes(&bytes).is_err());
    }

    #[test]
    fn wrong_pstrlen_rejected() {
        let mut bytes = expected_bytes();
        bytes[0] = 18;

        assert!(Handshake::from_bytes(&bytes).is_err());
    }
}
