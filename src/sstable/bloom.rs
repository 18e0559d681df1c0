use crate::error::{StoreError, StoreResult};

/// Upper bound on a deserialized filter; anything larger is corruption.
const MAX_FILTER_BYTES: usize = 128 * 1024 * 1024;

const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SEED_A: u64 = 0xcbf2_9ce4_8422_2325;
const SEED_B: u64 = 0x517c_c1b7_2722_0a95;

/// Partition-key membership filter attached to every sstable.
///
/// No false negatives: a `false` from [`BloomFilter::may_contain`] proves the
/// key is absent and lets the read path skip the sstable entirely. Sized for
/// the expected key count and target false-positive rate, probed with double
/// hashing (`h1 + i*h2`) over two FNV-1a hashes.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter optimally: `m = -n ln(p) / ln(2)^2` bits and
    /// `k = (m/n) ln(2)` probes.
    pub fn with_capacity(expected_keys: usize, false_positive_rate: f64) -> Self {
        let n = expected_keys.max(1) as f64;
        let p = false_positive_rate.clamp(1e-6, 0.5);
        let m = ((-n * p.ln()) / (std::f64::consts::LN_2 * std::f64::consts::LN_2)).ceil() as u64;
        let num_bits = m.max(64);
        let k = ((num_bits as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes: k.max(1),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hashes(key);
        for i in 0..self.num_hashes {
            let idx = probe(h1, h2, i, self.num_bits);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// `false` means definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hashes(key);
        (0..self.num_hashes).all(|i| {
            let idx = probe(h1, h2, i, self.num_bits);
            self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0
        })
    }

    /// Wire form, all little-endian:
    /// `[num_bits: u64][num_hashes: u32][len: u32][bits]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.bits.len());
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() < 16 {
            return Err(StoreError::serialization("bloom filter truncated"));
        }
        let num_bits = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let num_hashes = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        if len > MAX_FILTER_BYTES || bytes.len() != 16 + len || num_bits == 0 || num_hashes == 0 {
            return Err(StoreError::serialization("bloom filter malformed"));
        }
        Ok(Self {
            bits: bytes[16..].to_vec(),
            num_bits,
            num_hashes,
        })
    }
}

fn hashes(key: &[u8]) -> (u64, u64) {
    (fnv1a(key, SEED_A), fnv1a(key, SEED_B))
}

#[inline]
fn probe(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
}

fn fnv1a(data: &[u8], basis: u64) -> u64 {
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::with_capacity(100, 0.01);
        for i in 0..100u32 {
            filter.insert(&i.to_be_bytes());
        }
        for i in 0..100u32 {
            assert!(filter.may_contain(&i.to_be_bytes()));
        }
    }

    #[test]
    fn mostly_rejects_absent_keys() {
        let mut filter = BloomFilter::with_capacity(1000, 0.01);
        for i in 0..1000u32 {
            filter.insert(&i.to_be_bytes());
        }
        let false_positives = (10_000u32..20_000)
            .filter(|i| filter.may_contain(&i.to_be_bytes()))
            .count();
        // 1% target; leave generous slack for hash quirks.
        assert!(false_positives < 500, "false positives: {false_positives}");
    }

    #[test]
    fn wire_round_trip() {
        let mut filter = BloomFilter::with_capacity(10, 0.05);
        filter.insert(b"alpha");
        filter.insert(b"beta");
        let decoded = BloomFilter::from_bytes(&filter.to_bytes()).expect("decode");
        assert!(decoded.may_contain(b"alpha"));
        assert!(decoded.may_contain(b"beta"));
        assert_eq!(decoded.num_bits, filter.num_bits);
        assert_eq!(decoded.num_hashes, filter.num_hashes);
    }

    #[test]
    fn rejects_truncated_wire_form() {
        assert!(BloomFilter::from_bytes(&[0u8; 7]).is_err());
        let mut filter = BloomFilter::with_capacity(10, 0.05);
        filter.insert(b"x");
        let mut bytes = filter.to_bytes();
        bytes.pop();
        assert!(BloomFilter::from_bytes(&bytes).is_err());
    }
}
