//! Fixed-width, byte-comparable index keys.

/// A fixed-width key compared as raw bytes.
///
/// Integer constructors use order-preserving big-endian encodings so
/// byte order equals numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenericKey<const N: usize>(pub [u8; N]);

impl<const N: usize> GenericKey<N> {
    /// Width of the key in bytes.
    pub const SIZE: usize = N;

    /// The all-zero key (used for internal sentinel slots).
    pub fn zero() -> Self {
        Self([0u8; N])
    }

    /// Builds a key from raw bytes, truncating or zero-padding to fit.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; N];
        let len = bytes.len().min(N);
        data[..len].copy_from_slice(&bytes[..len]);
        Self(data)
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encodes a signed integer so byte order matches numeric order.
    /// Requires a key width of at least 8 bytes.
    pub fn from_i64(value: i64) -> Self {
        assert!(N >= 8, "key too narrow for an i64");
        let encoded = (value as u64) ^ (1 << 63);
        let mut data = [0u8; N];
        data[..8].copy_from_slice(&encoded.to_be_bytes());
        Self(data)
    }

    /// Decodes a key produced by `from_i64`.
    pub fn to_i64(&self) -> i64 {
        assert!(N >= 8, "key too narrow for an i64");
        let encoded = u64::from_be_bytes(self.0[..8].try_into().unwrap());
        (encoded ^ (1 << 63)) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_roundtrip() {
        for value in [i64::MIN, -1_000_000, -1, 0, 1, 42, i64::MAX] {
            let key = GenericKey::<8>::from_i64(value);
            assert_eq!(key.to_i64(), value);
        }
    }

    #[test]
    fn test_i64_encoding_is_order_preserving() {
        let values = [i64::MIN, -500, -1, 0, 1, 7, 500, i64::MAX];
        let keys: Vec<GenericKey<8>> = values.iter().map(|&v| GenericKey::from_i64(v)).collect();
        for window in keys.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn test_from_bytes_pads_and_truncates() {
        let key = GenericKey::<4>::from_bytes(b"ab");
        assert_eq!(key.as_bytes(), &[b'a', b'b', 0, 0]);

        let key = GenericKey::<4>::from_bytes(b"abcdef");
        assert_eq!(key.as_bytes(), b"abcd");
    }

    #[test]
    fn test_wider_keys_compare() {
        let a = GenericKey::<16>::from_i64(3);
        let b = GenericKey::<16>::from_i64(4);
        assert!(a < b);
        assert_eq!(a, GenericKey::<16>::from_i64(3));
    }
}
