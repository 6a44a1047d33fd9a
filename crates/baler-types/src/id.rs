use std::fmt;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::RngCore;
use serde::{Deserialize, Serialize};

type Blake2b256 = Blake2b<U32>;

/// Unkeyed BLAKE2b-256 of `data`.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let digest = Blake2b256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Defines a 32-byte content identifier newtype with the shared hex/hash helpers.
macro_rules! content_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// BLAKE2b-256 of `data`.
            pub fn compute(data: &[u8]) -> Self {
                $name(hash_bytes(data))
            }

            /// Random identifier, used for objects that are not content-addressed.
            pub fn random() -> Self {
                let mut buf = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut buf);
                $name(buf)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from a 64-character hex string.
            pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
                let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
                if bytes.len() != 32 {
                    return Err(format!("expected 32 bytes, got {}", bytes.len()));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok($name(arr))
            }

            /// All-zero id, never produced by `compute`.
            pub fn is_null(&self) -> bool {
                self.0 == [0u8; 32]
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }
    };
}

content_id!(
    /// Identifier of a blob: BLAKE2b-256 of its plaintext.
    BlobId,
    "BlobId"
);
content_id!(
    /// Identifier of a pack file: BLAKE2b-256 of the complete pack bytes.
    PackId,
    "PackId"
);
content_id!(
    /// Identifier of an index file: BLAKE2b-256 of its serialized bytes.
    IndexId,
    "IndexId"
);
content_id!(
    /// Identifier of a snapshot file: BLAKE2b-256 of its serialized bytes.
    SnapshotId,
    "SnapshotId"
);

impl BlobId {
    /// Low 64 bits of the id, used directly for hash-table bucket selection.
    /// The id is already a uniformly distributed hash.
    pub fn low_bits(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_deterministic() {
        assert_eq!(BlobId::compute(b"hello"), BlobId::compute(b"hello"));
        assert_ne!(BlobId::compute(b"hello"), BlobId::compute(b"world"));
    }

    #[test]
    fn hex_roundtrip() {
        let id = PackId::compute(b"pack bytes");
        let parsed = PackId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_hex().len(), 64);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(IndexId::from_hex("abcd").is_err());
        assert!(IndexId::from_hex("zz").is_err());
    }

    #[test]
    fn empty_data_is_not_null() {
        assert!(!BlobId::compute(b"").is_null());
        assert!(BlobId::default().is_null());
    }

    #[test]
    fn low_bits_reads_first_eight_bytes() {
        let mut raw = [0u8; 32];
        raw[0] = 0x01;
        raw[7] = 0x80;
        assert_eq!(BlobId(raw).low_bits(), 0x8000_0000_0000_0001);
    }

    #[test]
    fn display_is_short_prefix() {
        let id = SnapshotId([0xAB; 32]);
        assert_eq!(id.to_string(), "abababababababab");
        assert_eq!(format!("{id:?}"), "SnapshotId(abababababababab)");
    }
}
