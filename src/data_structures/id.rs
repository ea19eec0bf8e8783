use openssl::sha;
use rand::{thread_rng, Rng};
use std::fmt;

pub const ID_LEN: usize = 20;

/// A 20-byte identifier: SHA-1 digests (piece hashes, infohash) and peer ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ID([u8; ID_LEN]);

impl ID {
    pub fn new(id_array: [u8; ID_LEN]) -> Self {
        Self(id_array)
    }

    pub fn sha1(data: &[u8]) -> Self {
        Self(sha::sha1(data))
    }

    /// Peer id in the original client's style: 20 ASCII digits.
    pub fn random_numeric() -> Self {
        let mut rng = thread_rng();
        Self(std::array::from_fn(|_| rng.gen_range(b'0'..=b'9')))
    }

    pub fn as_byte_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl fmt::Display for ID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ID({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::ID;

    #[test]
    fn sha1_known_digest() {
        let id = ID::sha1(b"abc");
        assert_eq!(id.to_string(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn numeric_peer_id() {
        let id = ID::random_numeric();
        assert!(id.as_byte_ref().iter().all(|b| b.is_ascii_digit()));
    }
}
