use super::Bitmap;

/// Per-(piece, block) flags. Jagged: the last piece usually has fewer
/// blocks than the rest. Clones share the underlying per-piece bitmaps.
#[derive(Debug, Clone)]
pub struct BlockMap {
    pieces: Vec<Bitmap>,
}

impl BlockMap {
    pub fn new(block_counts: impl IntoIterator<Item = usize>) -> Self {
        Self {
            pieces: block_counts.into_iter().map(Bitmap::new).collect(),
        }
    }

    pub fn get(&self, piece: usize, block: usize) -> bool {
        self.pieces[piece].get(block)
    }

    pub fn set(&self, piece: usize, block: usize, val: bool) {
        self.pieces[piece].set(block, val);
    }

    pub fn block_count(&self, piece: usize) -> usize {
        self.pieces[piece].len()
    }

    pub fn piece_weight(&self, piece: usize) -> usize {
        self.pieces[piece].weight()
    }

    pub fn is_piece_complete(&self, piece: usize) -> bool {
        self.pieces[piece].weight() == self.pieces[piece].len()
    }

    /// Fraction of the piece's blocks currently held, in [0.0, 1.0].
    pub fn piece_progress(&self, piece: usize) -> f64 {
        self.pieces[piece].weight() as f64 / self.pieces[piece].len() as f64
    }

    pub fn fill_piece(&self, piece: usize) {
        for block in 0..self.pieces[piece].len() {
            self.pieces[piece].set(block, true);
        }
    }

    pub fn clear_piece(&self, piece: usize) {
        for block in 0..self.pieces[piece].len() {
            self.pieces[piece].set(block, false);
        }
    }

    pub fn weight(&self) -> usize {
        self.pieces.iter().map(|p| p.weight()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::BlockMap;

    #[test]
    fn jagged_shape() {
        let bm = BlockMap::new([4, 4, 2]);

        assert_eq!(4, bm.block_count(0));
        assert_eq!(2, bm.block_count(2));
        assert_eq!(0, bm.weight());
    }

    #[test]
    fn fill_and_clear() {
        let bm = BlockMap::new([4, 4, 2]);

        bm.set(1, 2, true);
        assert!(bm.get(1, 2));
        assert!(!bm.is_piece_complete(1));
        assert_eq!(0.25, bm.piece_progress(1));

        bm.fill_piece(1);
        assert!(bm.is_piece_complete(1));
        assert_eq!(1.0, bm.piece_progress(1));
        assert_eq!(4, bm.piece_weight(1));

        bm.clear_piece(1);
        assert_eq!(0, bm.piece_weight(1));
    }

    #[test]
    fn shared_between_clones() {
        let bm = BlockMap::new([2, 2]);
        let clone = bm.clone();

        clone.set(0, 1, true);

        assert!(bm.get(0, 1));
    }
}
