//! Transparent compression and encryption for durable values.
//!
//! The backend stores strings, so every encoded form is text:
//!
//! | Stored form | Meaning |
//! |---|---|
//! | `{...}` | plain envelope JSON |
//! | `z1:<base64>` | zstd-compressed envelope JSON |
//! | `e1:<base64>` | AES-256-GCM ciphertext of one of the forms above, 12-byte nonce prefix |
//!
//! Compression is applied before encryption. Decoding detects each layer
//! from its tag, and compressed payloads are additionally checked against
//! the zstd magic bytes.
//!
//! # Example
//!
//! ```
//! use offline_sync::storage::codec::{decode, encode, Cipher, Layers};
//!
//! let cipher = Cipher::from_hex_key(&"11".repeat(32)).unwrap();
//! let layers = Layers { compressed: true, encrypted: true };
//!
//! let stored = encode(r#"{"a":1}"#, layers, Some(&cipher)).unwrap();
//! assert!(stored.starts_with("e1:"));
//!
//! let (json, seen) = decode(&stored, Some(&cipher)).unwrap();
//! assert_eq!(json, r#"{"a":1}"#);
//! assert_eq!(seen, layers);
//! ```

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::traits::StorageError;

/// Zstd magic bytes (little-endian): 0xFD2FB528
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default compression level (3 is a good balance of speed/ratio)
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const COMPRESSED_TAG: &str = "z1:";
const ENCRYPTED_TAG: &str = "e1:";
const NONCE_LEN: usize = 12;

/// Which layers wrap a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Layers {
    pub compressed: bool,
    pub encrypted: bool,
}

/// AES-256-GCM key holder.
#[derive(Clone)]
pub struct Cipher {
    inner: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(<redacted>)")
    }
}

impl Cipher {
    /// Build from a hex-encoded 32-byte key.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, StorageError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| StorageError::Codec(format!("invalid key hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(key: &[u8]) -> Result<Self, StorageError> {
        let inner = Aes256Gcm::new_from_slice(key)
            .map_err(|_| StorageError::Codec(format!("key must be 32 bytes, got {}", key.len())))?;
        Ok(Self { inner })
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .inner
            .encrypt(&nonce, plaintext)
            .map_err(|_| StorageError::Codec("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StorageError> {
        if sealed.len() < NONCE_LEN {
            return Err(StorageError::Codec("ciphertext shorter than nonce".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.inner
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StorageError::Codec("decryption failed (wrong key or tampered data)".into()))
    }
}

/// Check if data is zstd-compressed by checking magic bytes.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Encode serialized envelope JSON into its stored form.
pub fn encode(json: &str, layers: Layers, cipher: Option<&Cipher>) -> Result<String, StorageError> {
    let mut out = if layers.compressed {
        let compressed = zstd::encode_all(json.as_bytes(), DEFAULT_COMPRESSION_LEVEL)
            .map_err(|e| StorageError::Codec(format!("compression failed: {}", e)))?;
        format!("{}{}", COMPRESSED_TAG, STANDARD.encode(compressed))
    } else {
        json.to_string()
    };

    if layers.encrypted {
        let cipher = cipher.ok_or_else(|| StorageError::Codec("encryption requested but no key configured".into()))?;
        let sealed = cipher.seal(out.as_bytes())?;
        out = format!("{}{}", ENCRYPTED_TAG, STANDARD.encode(sealed));
    }

    Ok(out)
}

/// Decode a stored value back to envelope JSON, reporting which layers were present.
pub fn decode(stored: &str, cipher: Option<&Cipher>) -> Result<(String, Layers), StorageError> {
    let mut layers = Layers::default();

    let inner = match stored.strip_prefix(ENCRYPTED_TAG) {
        Some(payload) => {
            let cipher = cipher.ok_or_else(|| StorageError::Codec("value is encrypted but no key configured".into()))?;
            let sealed = STANDARD
                .decode(payload)
                .map_err(|e| StorageError::Codec(format!("invalid base64: {}", e)))?;
            layers.encrypted = true;
            String::from_utf8(cipher.open(&sealed)?)
                .map_err(|e| StorageError::Codec(format!("decrypted value is not UTF-8: {}", e)))?
        }
        None => stored.to_string(),
    };

    let json = match inner.strip_prefix(COMPRESSED_TAG) {
        Some(payload) => {
            let bytes = STANDARD
                .decode(payload)
                .map_err(|e| StorageError::Codec(format!("invalid base64: {}", e)))?;
            if !is_compressed(&bytes) {
                return Err(StorageError::Codec("compressed tag without zstd frame".into()));
            }
            let raw = zstd::decode_all(bytes.as_slice())
                .map_err(|e| StorageError::Codec(format!("decompression failed: {}", e)))?;
            layers.compressed = true;
            String::from_utf8(raw)
                .map_err(|e| StorageError::Codec(format!("decompressed value is not UTF-8: {}", e)))?
        }
        None => inner,
    };

    Ok((json, layers))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::from_hex_key(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn test_plain_passthrough() {
        let stored = encode(r#"{"x":1}"#, Layers::default(), None).unwrap();
        assert_eq!(stored, r#"{"x":1}"#);

        let (json, layers) = decode(&stored, None).unwrap();
        assert_eq!(json, r#"{"x":1}"#);
        assert_eq!(layers, Layers::default());
    }

    #[test]
    fn test_compression_shrinks_repetitive_json() {
        let json = format!("[{}]", vec![r#"{"status":"pending","mileage":1000}"#; 200].join(","));
        let layers = Layers { compressed: true, encrypted: false };

        let stored = encode(&json, layers, None).unwrap();

        assert!(stored.starts_with(COMPRESSED_TAG));
        assert!(stored.len() < json.len() / 4);
        assert_eq!(decode(&stored, None).unwrap(), (json, layers));
    }

    #[test]
    fn test_encryption_hides_plaintext() {
        let layers = Layers { compressed: false, encrypted: true };
        let stored = encode(r#"{"vin":"WVW123"}"#, layers, Some(&cipher())).unwrap();

        assert!(stored.starts_with(ENCRYPTED_TAG));
        assert!(!stored.contains("WVW123"));
        assert_eq!(decode(&stored, Some(&cipher())).unwrap().0, r#"{"vin":"WVW123"}"#);
    }

    #[test]
    fn test_nonces_differ_per_write() {
        let layers = Layers { compressed: false, encrypted: true };
        let a = encode("{}", layers, Some(&cipher())).unwrap();
        let b = encode("{}", layers, Some(&cipher())).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let layers = Layers { compressed: true, encrypted: true };
        let stored = encode("{}", layers, Some(&cipher())).unwrap();
        let other = Cipher::from_hex_key(&"cd".repeat(32)).unwrap();

        assert!(matches!(decode(&stored, Some(&other)), Err(StorageError::Codec(_))));
        assert!(matches!(decode(&stored, None), Err(StorageError::Codec(_))));
    }

    #[test]
    fn test_encrypt_without_key_is_error() {
        let layers = Layers { compressed: false, encrypted: true };
        assert!(encode("{}", layers, None).is_err());
    }

    #[test]
    fn test_bad_key_length() {
        assert!(Cipher::from_hex_key("abcd").is_err());
        assert!(Cipher::from_hex_key("not hex").is_err());
    }

    #[test]
    fn test_compressed_tag_without_frame_rejected() {
        let bogus = format!("{}{}", COMPRESSED_TAG, STANDARD.encode(b"plain"));
        assert!(decode(&bogus, None).is_err());
    }
}
