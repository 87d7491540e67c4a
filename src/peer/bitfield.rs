use bytes::Bytes;

/// Which pieces a peer has, one bit per piece.
///
/// Bits are numbered from the high bit of the first byte, as on the wire.
/// Spare bits in the last byte are kept zero; a peer setting them is a
/// protocol violation the caller can detect with [`Bitfield::from_wire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// All pieces set; what a seed announces.
    pub fn full(num_pieces: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xff; num_pieces.div_ceil(8)],
            num_pieces,
        };
        bf.mask_spare_bits();
        bf
    }

    /// Parses a wire bitfield. Returns `None` on wrong length or set
    /// spare bits.
    pub fn from_wire(bytes: &Bytes, num_pieces: usize) -> Option<Self> {
        if bytes.len() != num_pieces.div_ceil(8) {
            return None;
        }
        let bf = Self {
            bits: bytes.to_vec(),
            num_pieces,
        };
        let mut masked = bf.clone();
        masked.mask_spare_bits();
        if masked.bits != bf.bits {
            return None;
        }
        Some(bf)
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bits[index / 8] >> (7 - index % 8) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.num_pieces {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.num_pieces {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn to_wire(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates set piece indices.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(move |&i| self.has(i))
    }

    fn mask_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.num_pieces;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
    }
}
