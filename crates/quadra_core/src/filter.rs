//! Minimal, stable Bloom filter for read-only segments (advisory).
#[derive(Clone, Debug)]
pub struct Bloom {
    pub m_bits: u32,
    pub k: u32,
    pub bits: Vec<u8>,
}

impl Bloom {
    /// `m_bits` is rounded up to whole bytes so `from_bytes` sees the same modulus.
    pub fn new(m_bits: u32, k: u32) -> Self {
        let bytes = (m_bits as usize).div_ceil(8);
        Self { m_bits: (bytes * 8) as u32, k: k.max(1), bits: vec![0u8; bytes] }
    }

    /// Sized for `n` keys at roughly `bits_per_key`, capped at `max_bits`.
    pub fn for_keys(n: usize, bits_per_key: u32, max_bits: u32, k: u32) -> Self {
        let want = (n as u64).saturating_mul(bits_per_key as u64).max(64);
        Self::new(want.min(max_bits as u64) as u32, k)
    }

    pub fn from_bytes(k: u32, bits: Vec<u8>) -> Self {
        let m_bits = (bits.len() * 8) as u32;
        Self { m_bits, k: k.max(1), bits }
    }

    #[inline]
    fn hashes(&self, key: &[u8]) -> impl Iterator<Item = u32> {
        let dig = *blake3::hash(key).as_bytes();
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&dig[0..8]);
        h2.copy_from_slice(&dig[8..16]);
        let h1 = u64::from_le_bytes(h1);
        let h2 = u64::from_le_bytes(h2);
        let m = self.m_bits as u64;
        (0..self.k).map(move |i| ((h1.wrapping_add((i as u64).wrapping_mul(h2))) % m) as u32)
    }

    pub fn add(&mut self, key: &[u8]) {
        if self.m_bits == 0 {
            return;
        }
        let hs: Vec<u32> = self.hashes(key).collect();
        for bit in hs {
            let idx = (bit / 8) as usize;
            let off = (bit & 7) as u8;
            self.bits[idx] |= 1u8 << off;
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        if self.m_bits == 0 {
            return true;
        }
        self.hashes(key).all(|bit| {
            let idx = (bit / 8) as usize;
            let off = (bit & 7) as u8;
            (self.bits[idx] & (1u8 << off)) != 0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut b = Bloom::for_keys(100, 10, 1 << 20, 7);
        for i in 0..100u32 {
            b.add(&i.to_le_bytes());
        }
        for i in 0..100u32 {
            assert!(b.contains(&i.to_le_bytes()));
        }
        let copy = Bloom::from_bytes(b.k, b.bits.clone());
        assert!(copy.contains(&7u32.to_le_bytes()));
    }

    #[test]
    fn odd_sizes_survive_reload() {
        // 10 keys x 10 bits = 100 bits, not a whole number of bytes
        let mut b = Bloom::for_keys(10, 10, 1 << 20, 5);
        assert_eq!(b.m_bits % 8, 0);
        for i in 0..10u32 {
            b.add(&i.to_le_bytes());
        }
        let copy = Bloom::from_bytes(b.k, b.bits.clone());
        assert_eq!(copy.m_bits, b.m_bits);
        for i in 0..10u32 {
            assert!(copy.contains(&i.to_le_bytes()));
        }
    }
}
