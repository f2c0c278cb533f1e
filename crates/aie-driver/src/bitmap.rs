//! In-use tracking for gateable tiles.
//!
//! One bit per row>0 tile, column-major, mirroring what the kernel believes
//! about tile clocks. The shim row is never gated and has no bit.

use aie_chip::{ArrayTopology, TileLoc};

/// Bitmap of ungated tiles across a partition.
#[derive(Debug, Clone)]
pub struct GatingBitmap {
    words: Vec<u32>,
    bits: u32,
}

const WORD_BITS: u32 = 32;

impl GatingBitmap {
    /// All-gated bitmap sized for `topology`.
    pub fn new(topology: &ArrayTopology) -> Self {
        let bits = topology.gating_bits();
        let words = vec![0u32; bits.div_ceil(WORD_BITS) as usize];
        Self { words, bits }
    }

    /// Number of tracked bits.
    pub fn len(&self) -> u32 {
        self.bits
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Whether bit `pos` is set. Out-of-range positions read as gated.
    pub fn is_set(&self, pos: u32) -> bool {
        if pos >= self.bits {
            return false;
        }
        self.words[(pos / WORD_BITS) as usize] & (1 << (pos % WORD_BITS)) != 0
    }

    /// Set `count` bits starting at `pos`, saturating at the bitmap end.
    pub fn set_range(&mut self, pos: u32, count: u32) {
        for bit in pos..(pos + count).min(self.bits) {
            self.words[(bit / WORD_BITS) as usize] |= 1 << (bit % WORD_BITS);
        }
    }

    /// Clear `count` bits starting at `pos`, saturating at the bitmap end.
    pub fn clear_range(&mut self, pos: u32, count: u32) {
        for bit in pos..(pos + count).min(self.bits) {
            self.words[(bit / WORD_BITS) as usize] &= !(1 << (bit % WORD_BITS));
        }
    }

    /// Clear every bit.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Set every bit.
    pub fn set_all(&mut self) {
        let bits = self.bits;
        self.set_range(0, bits);
    }

    /// Whether a tile's bit is set.
    pub fn tile_is_set(&self, topology: &ArrayTopology, loc: TileLoc) -> bool {
        loc.row > 0 && self.is_set(topology.tile_bit_pos(loc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo() -> ArrayTopology {
        ArrayTopology::aieml(4)
    }

    #[test]
    fn starts_all_gated() {
        let bm = GatingBitmap::new(&topo());
        assert_eq!(bm.len(), 20);
        assert!(bm.is_empty());
        assert!(!bm.is_set(0));
    }

    #[test]
    fn set_and_clear_ranges() {
        let mut bm = GatingBitmap::new(&topo());
        bm.set_range(3, 5);
        for bit in 0..bm.len() {
            assert_eq!(bm.is_set(bit), (3..8).contains(&bit));
        }
        bm.clear_range(4, 2);
        assert!(bm.is_set(3));
        assert!(!bm.is_set(4));
        assert!(!bm.is_set(5));
        assert!(bm.is_set(6));
        bm.clear_all();
        assert!(bm.is_empty());
    }

    #[test]
    fn ranges_saturate_at_the_end() {
        let mut bm = GatingBitmap::new(&topo());
        bm.set_range(18, 100);
        assert!(bm.is_set(19));
        assert!(!bm.is_set(20));
    }

    #[test]
    fn tile_lookup_uses_column_major_bits() {
        let t = topo();
        let mut bm = GatingBitmap::new(&t);
        bm.set_range(t.tile_bit_pos(TileLoc::new(2, 1)), 1);
        assert!(bm.tile_is_set(&t, TileLoc::new(2, 1)));
        assert!(!bm.tile_is_set(&t, TileLoc::new(2, 0)));
        // Shim row is never tracked.
        assert!(!bm.tile_is_set(&t, TileLoc::new(0, 1)));
    }
}
