use bytes::Bytes;
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::detour::relay::protocol::{self, ProtocolError, RelayMessage};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame did not authenticate under our secret (wrong secret,
    /// corruption or truncation).
    #[error("frame failed authentication")]
    Auth,
    #[error("frame authenticated but body is invalid: {0}")]
    Malformed(#[from] ProtocolError),
    #[error("seal failed")]
    Seal,
}

impl CodecError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CodecError::Auth)
    }
}

/// Seals relay messages with ChaCha20-Poly1305 keyed by SHA-256 of a shared
/// secret. Frame layout: `nonce(12) | ciphertext | tag(16)`.
#[derive(Clone)]
pub struct Codec {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec").finish_non_exhaustive()
    }
}

impl Codec {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: ChaCha20Poly1305::new(&key),
        }
    }

    pub fn pack(&self, msg: &RelayMessage) -> Result<Bytes, CodecError> {
        let body = protocol::encode_body(msg)?;

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), body.as_ref())
            .map_err(|_| CodecError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(Bytes::from(out))
    }

    pub fn unpack(&self, frame: &[u8]) -> Result<RelayMessage, CodecError> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(CodecError::Auth);
        }
        let (nonce, sealed) = frame.split_at(NONCE_LEN);
        let body = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CodecError::Auth)?;
        Ok(protocol::decode_body(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detour::relay::protocol::{Command, SessionId};

    fn sample() -> Vec<RelayMessage> {
        vec![
            RelayMessage::connect(SessionId::from("S1"), "tcp", "example.com:80"),
            RelayMessage::connect_ok("S1".into()),
            RelayMessage::connect_err("S1".into(), "connection refused"),
            RelayMessage::data("S1".into(), Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n")),
            RelayMessage::half_close("S1".into()),
            RelayMessage::reconnect("S2".into()),
        ]
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let codec = Codec::new("password");
        for m in sample() {
            let frame = codec.pack(&m).unwrap();
            assert_eq!(codec.unpack(&frame).unwrap(), m);
        }
    }

    #[test]
    fn wrong_secret_is_auth_error() {
        let a = Codec::new("secret-a");
        let b = Codec::new("secret-b");
        for m in sample() {
            let frame = a.pack(&m).unwrap();
            assert!(b.unpack(&frame).unwrap_err().is_auth());
        }
    }

    #[test]
    fn corrupt_or_truncated_frames_are_auth_errors() {
        let codec = Codec::new("pw");
        let frame = codec
            .pack(&RelayMessage::data("S1".into(), Bytes::from_static(b"payload")))
            .unwrap();

        let mut flipped = frame.to_vec();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x80;
        assert!(codec.unpack(&flipped).unwrap_err().is_auth());

        for cut in [0, 5, NONCE_LEN, NONCE_LEN + TAG_LEN, frame.len() - 1] {
            assert!(codec.unpack(&frame[..cut]).unwrap_err().is_auth());
        }
    }

    #[test]
    fn same_message_packs_to_distinct_frames() {
        let codec = Codec::new("pw");
        let m = RelayMessage::connect_ok("S1".into());
        let f1 = codec.pack(&m).unwrap();
        let f2 = codec.pack(&m).unwrap();
        assert_ne!(f1, f2);
        assert_eq!(codec.unpack(&f2).unwrap().command(), Command::Connect);
    }
}
