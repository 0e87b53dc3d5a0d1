//! Stateful digest wrappers used for peer fingerprints.

use sha1::Digest as _;

/// Incremental SHA-256.
pub struct Sha256(sha2::Sha256);

impl Sha256 {
    pub fn new() -> Self {
        Sha256(sha2::Sha256::new())
    }

    pub fn reset(&mut self) {
        self.0 = sha2::Sha256::new();
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.0.update(data.as_ref());
    }

    /// Finalize and reset, returning the 32-byte digest.
    pub fn digest(&mut self) -> [u8; 32] {
        self.0.finalize_reset().into()
    }
}

impl Default for Sha256 {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental SHA-1. The digest is 20 bytes.
pub struct Sha1(sha1::Sha1);

impl Sha1 {
    pub fn new() -> Self {
        Sha1(sha1::Sha1::new())
    }

    pub fn reset(&mut self) {
        self.0 = sha1::Sha1::new();
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.0.update(data.as_ref());
    }

    /// Finalize and reset, returning the 20-byte digest.
    pub fn digest(&mut self) -> [u8; 20] {
        self.0.finalize_reset().into()
    }
}

impl Default for Sha1 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot SHA-256.
pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.digest()
}

/// One-shot SHA-1.
pub fn sha1(data: impl AsRef<[u8]>) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(data);
    h.digest()
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS 180 test vectors for "abc"
    const ABC_SHA256: [u8; 32] = [
        0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae, 0x22,
        0x23, 0xb0, 0x03, 0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61, 0xf2, 0x00,
        0x15, 0xad,
    ];
    const ABC_SHA1: [u8; 20] = [
        0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50, 0xc2,
        0x6c, 0x9c, 0xd0, 0xd8, 0x9d,
    ];

    #[test]
    fn sha256_abc() {
        assert_eq!(sha256(b"abc"), ABC_SHA256);
    }

    #[test]
    fn sha1_abc_is_twenty_bytes() {
        let d = sha1(b"abc");
        assert_eq!(d.len(), 20);
        assert_eq!(d, ABC_SHA1);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut h = Sha256::new();
        h.update(b"a");
        h.update(b"bc");
        assert_eq!(h.digest(), sha256(b"abc"));
        // digest() resets
        h.update(b"abc");
        assert_eq!(h.digest(), ABC_SHA256);
    }

    #[test]
    fn reset_discards_state() {
        let mut h = Sha1::new();
        h.update(b"garbage");
        h.reset();
        h.update(b"abc");
        assert_eq!(h.digest(), ABC_SHA1);
    }
}
