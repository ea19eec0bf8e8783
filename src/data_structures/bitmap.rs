use std::sync::{Arc, Mutex as StdMutex};

/// Fixed-length bit set, one bit per piece, MSB-first within each byte.
/// Clones share the underlying data, so a single map can be read and
/// updated from several tasks.
#[derive(Debug, Clone)]
pub struct Bitmap {
    data: Arc<StdMutex<Vec<u8>>>,
    len: usize,
}

impl Bitmap {
    pub fn new(n: usize) -> Self {
        let number_of_bytes_needed = crate::unsigned_ceil_div!(n.max(1), 8);
        Self {
            data: Arc::new(StdMutex::new(vec![0; number_of_bytes_needed])),
            len: n,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, i: usize) -> bool {
        let byte_idx = i / 8;
        let bit_offset = i % 8;

        let bits = 0b1000_0000u8 >> bit_offset;

        bits & self.data.lock().unwrap()[byte_idx] > 0
    }

    pub fn set(&self, idx: usize, val: bool) {
        let mut data = self.data.lock().unwrap();

        let byte_idx = idx / 8;
        let bit_offset = idx % 8;

        let bits = 0b1000_0000u8 >> bit_offset;

        if val {
            data[byte_idx] |= bits;
        } else {
            data[byte_idx] &= !bits;
        }
    }

    pub fn weight(&self) -> usize {
        self.data
            .lock()
            .unwrap()
            .iter()
            .fold(0, |weight, x| weight + x.count_ones() as usize)
    }

    /// Snapshot of the raw bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::Bitmap;
    use crate::unsigned_ceil_div;

    #[test]
    fn setup() {
        let len = 67;
        let bm = Bitmap::new(len);

        assert_eq!(len, bm.len());
        assert_eq!(unsigned_ceil_div!(67, 8), bm.to_bytes().len());
        assert_eq!(0, bm.weight());
    }

    #[test]
    fn set_and_get() {
        let bm = Bitmap::new(67);

        bm.set(0, true);
        bm.set(7 * 8 + 1, true);
        bm.set(66, true);

        assert!(bm.get(0));
        assert!(bm.get(57));
        assert!(bm.get(66));
        assert!(!bm.get(1));
        assert_eq!(3, bm.weight());

        bm.set(57, false);
        assert!(!bm.get(57));
        assert_eq!(2, bm.weight());
    }

    #[test]
    fn shared_between_clones() {
        let bm = Bitmap::new(21);
        let clone = bm.clone();

        clone.set(13, true);

        assert!(bm.get(13));
    }

    #[test]
    fn snapshot() {
        let bm = Bitmap::new(21);

        bm.set(0, true);
        bm.set(8, true);
        bm.set(9, true);

        assert_eq!(vec![0b1000_0000, 0b1100_0000, 0], bm.to_bytes());
    }
}
