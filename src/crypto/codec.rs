//! Chunk codec: plaintext <-> 7-bit clean message body.
//!
//! encode: AES-256-GCM under the mount content key with a derived nonce,
//! then base64 wrapped at 76 columns with CRLF line breaks.
//! decode: the reverse, plus a SHA-256 check of the recovered plaintext.
//!
//! Any failure on the decode path is corruption. Nothing here retries or
//! falls back to partial data.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;
use zeroize::Zeroizing;

use super::aes::{self, AES_KEY_SIZE, AES_TAG_SIZE};
use super::nonce::{derive_nonce, NonceContext};
use super::utils::sha256_hex;

/// Base64 line width of an encoded body.
pub const LINE_WIDTH: usize = 76;

/// Bytes of a message kept aside for headers when sizing bodies.
pub const HEADER_RESERVE: usize = 2048;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Corrupt payload: {0}")]
    Corrupt(&'static str),
    #[error("Encoded body of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("Encryption failed")]
    EncryptionFailed,
}

/// Output of one `encode` call.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Wrapped base64 body, ready to append.
    pub payload: String,
    /// SHA-256 hex of the plaintext.
    pub checksum: String,
    pub plain_len: u64,
    pub encoded_len: u64,
}

/// Encoded body size for a plaintext of `plain_len` bytes, line breaks included.
pub fn encoded_len_for(plain_len: usize) -> usize {
    let b64 = (plain_len + AES_TAG_SIZE).div_ceil(3) * 4;
    let lines = b64.div_ceil(LINE_WIDTH).max(1);
    b64 + 2 * (lines - 1)
}

/// Holds the mount content key. Cheap to share behind an `Arc`.
pub struct ChunkCodec {
    key: Zeroizing<[u8; AES_KEY_SIZE]>,
    max_body_size: usize,
}

impl ChunkCodec {
    /// `max_message_size` is the remote store's per-message limit; bodies
    /// are allowed whatever is left after `HEADER_RESERVE`.
    pub fn new(key: Zeroizing<[u8; AES_KEY_SIZE]>, max_message_size: usize) -> Self {
        Self {
            key,
            max_body_size: max_message_size.saturating_sub(HEADER_RESERVE),
        }
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Fails with `TooLarge` before encrypting if the body could not be stored.
    pub fn encode(
        &self,
        plaintext: &[u8],
        ctx: &NonceContext<'_>,
    ) -> Result<EncodedChunk, CodecError> {
        let expected = encoded_len_for(plaintext.len());
        if expected > self.max_body_size {
            return Err(CodecError::TooLarge {
                size: expected,
                limit: self.max_body_size,
            });
        }

        let nonce = derive_nonce(ctx);
        let ciphertext = aes::encrypt_aes_gcm(plaintext, &self.key, &nonce)
            .map_err(|_| CodecError::EncryptionFailed)?;
        let payload = wrap_lines(&STANDARD.encode(&ciphertext));

        Ok(EncodedChunk {
            encoded_len: payload.len() as u64,
            payload,
            checksum: sha256_hex(plaintext),
            plain_len: plaintext.len() as u64,
        })
    }

    /// Decode a body. When `checksum` is given the plaintext must hash to it.
    pub fn decode(
        &self,
        payload: &[u8],
        ctx: &NonceContext<'_>,
        checksum: Option<&str>,
    ) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        let compact: Vec<u8> = payload
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let ciphertext = STANDARD
            .decode(&compact)
            .map_err(|_| CodecError::Corrupt("malformed base64"))?;

        let nonce = derive_nonce(ctx);
        let plaintext = Zeroizing::new(
            aes::decrypt_aes_gcm(&ciphertext, &self.key, &nonce)
                .map_err(|_| CodecError::Corrupt("authentication tag mismatch"))?,
        );

        if let Some(expected) = checksum {
            if sha256_hex(&plaintext) != expected {
                return Err(CodecError::Corrupt("checksum mismatch"));
            }
        }
        Ok(plaintext)
    }
}

fn wrap_lines(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH * 2);
    let mut start = 0;
    while start < encoded.len() {
        let end = (start + LINE_WIDTH).min(encoded.len());
        if start > 0 {
            out.push_str("\r\n");
        }
        // base64 output is ASCII, so byte offsets are char boundaries
        out.push_str(&encoded[start..end]);
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ChunkCodec {
        ChunkCodec::new(Zeroizing::new([42u8; 32]), 1024 * 1024)
    }

    fn ctx(index: u32) -> NonceContext<'static> {
        NonceContext::chunk("0123456789abcdef0123456789abcdef", 1, "a1b2c3d4e5f60708", index)
    }

    #[test]
    fn test_roundtrip() {
        let codec = codec();
        for plaintext in [&b""[..], &b"x"[..], &[7u8; 1000][..]] {
            let encoded = codec.encode(plaintext, &ctx(0)).unwrap();
            let decoded = codec
                .decode(encoded.payload.as_bytes(), &ctx(0), Some(&encoded.checksum))
                .unwrap();
            assert_eq!(&decoded[..], plaintext);
            assert_eq!(encoded.plain_len, plaintext.len() as u64);
        }
    }

    #[test]
    fn test_payload_is_wrapped_ascii() {
        let encoded = codec().encode(&[0xFFu8; 500], &ctx(0)).unwrap();
        assert!(encoded.payload.is_ascii());
        for line in encoded.payload.split("\r\n") {
            assert!(line.len() <= LINE_WIDTH);
        }
        assert_eq!(encoded.encoded_len as usize, encoded_len_for(500));
    }

    #[test]
    fn test_tampered_tag_is_corruption() {
        let codec = codec();
        let encoded = codec.encode(b"sensitive", &ctx(0)).unwrap();
        let mut raw = STANDARD
            .decode(encoded.payload.replace("\r\n", ""))
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = STANDARD.encode(&raw);
        assert!(matches!(
            codec.decode(tampered.as_bytes(), &ctx(0), None),
            Err(CodecError::Corrupt(_))
        ));
    }

    #[test]
    fn test_wrong_context_is_corruption() {
        let codec = codec();
        let encoded = codec.encode(b"data", &ctx(0)).unwrap();
        assert!(codec.decode(encoded.payload.as_bytes(), &ctx(1), None).is_err());
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let codec = codec();
        let encoded = codec.encode(b"data", &ctx(0)).unwrap();
        let err = codec
            .decode(encoded.payload.as_bytes(), &ctx(0), Some(&sha256_hex(b"other")))
            .unwrap_err();
        assert!(matches!(err, CodecError::Corrupt("checksum mismatch")));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let codec = ChunkCodec::new(Zeroizing::new([1u8; 32]), HEADER_RESERVE + 100);
        assert!(matches!(
            codec.encode(&[0u8; 200], &ctx(0)),
            Err(CodecError::TooLarge { .. })
        ));
    }
}
