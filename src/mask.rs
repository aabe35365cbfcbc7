//! Position-keyed XOR masking applied to every file payload.
//!
//! Byte `i` of a payload is stored as `data[i] ^ key[i % 16] ^ (i & 0xFF)`.
//! `i` always counts from the first byte of that file's own payload, never
//! from the start of the archive, so masking the same slice twice with the
//! same starting position restores it.

use std::fmt;

/// Length of the mask key carried in the header.
pub const MASK_KEY_LEN: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskKey(pub [u8; MASK_KEY_LEN]);

impl MaskKey {
    pub fn random() -> Self {
        MaskKey(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; MASK_KEY_LEN] {
        &self.0
    }

    /// Parse a 32-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let key: [u8; MASK_KEY_LEN] = bytes.try_into().ok()?;
        Some(MaskKey(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; MASK_KEY_LEN]> for MaskKey {
    fn from(bytes: [u8; MASK_KEY_LEN]) -> Self {
        MaskKey(bytes)
    }
}

impl fmt::Debug for MaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaskKey({})", self.to_hex())
    }
}

/// Mask `data` in place, treating `data[0]` as payload position `start`.
#[inline]
pub fn mask_in_place(data: &mut [u8], key: &MaskKey, start: u64) {
    for (i, byte) in data.iter_mut().enumerate() {
        let pos = start.wrapping_add(i as u64);
        *byte ^= key.0[(pos % MASK_KEY_LEN as u64) as usize] ^ (pos as u8);
    }
}

/// Mask a whole payload starting at position 0.
pub fn mask(data: &[u8], key: &MaskKey) -> Vec<u8> {
    let mut out = data.to_vec();
    mask_in_place(&mut out, key, 0);
    out
}

/// Streaming masker for one payload; carries the file-local position
/// across chunk boundaries.
#[derive(Debug, Clone)]
pub struct Masker {
    key:      MaskKey,
    position: u64,
}

impl Masker {
    pub fn new(key: MaskKey) -> Self {
        Self { key, position: 0 }
    }

    pub fn apply(&mut self, chunk: &mut [u8]) {
        mask_in_place(chunk, &self.key, self.position);
        self.position += chunk.len() as u64;
    }

    /// Bytes masked so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_key_masks_with_position_only() {
        let key = MaskKey([0u8; 16]);
        assert_eq!(mask(b"abc", &key), vec![b'a', b'b' ^ 1, b'c' ^ 2]);
    }

    #[test]
    fn position_wraps_into_low_byte() {
        let key = MaskKey([0u8; 16]);
        let data = vec![0u8; 300];
        let masked = mask(&data, &key);
        assert_eq!(masked[255], 255);
        assert_eq!(masked[256], 0);
        assert_eq!(masked[257], 1);
    }

    #[test]
    fn chunked_masking_matches_whole_payload() {
        let key = MaskKey(*b"0123456789abcdef");
        let data: Vec<u8> = (0u8..=255).cycle().take(5000).collect();
        let whole = mask(&data, &key);

        let mut chunked = data.clone();
        let mut masker = Masker::new(key);
        for chunk in chunked.chunks_mut(333) {
            masker.apply(chunk);
        }
        assert_eq!(chunked, whole);
        assert_eq!(masker.position(), 5000);
    }

    #[test]
    fn hex_roundtrip() {
        let key = MaskKey(*b"\x00\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f");
        assert_eq!(key.to_hex(), "000102030405060708090a0b0c0d0e0f");
        assert_eq!(MaskKey::from_hex(&key.to_hex()), Some(key));
        assert_eq!(MaskKey::from_hex("0011"), None);
        assert_eq!(MaskKey::from_hex("zz"), None);
    }

    proptest! {
        #[test]
        fn mask_is_an_involution(data in proptest::collection::vec(any::<u8>(), 0..2048),
                                 key in any::<[u8; 16]>(),
                                 start in any::<u64>()) {
            let key = MaskKey(key);
            let mut buf = data.clone();
            mask_in_place(&mut buf, &key, start);
            mask_in_place(&mut buf, &key, start);
            prop_assert_eq!(buf, data);
        }
    }
}
