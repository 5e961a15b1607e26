//! HMAC-signed values for cookies and socket tickets.
//!
//! A signed value is `base64(HMAC-SHA256(key, name ‖ value)) ‖ value`. Binding
//! the name into the MAC stops a value minted for one purpose (a ticket) from
//! being replayed as another (a session cookie).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of the base64 encoded SHA-256 MAC prefix.
pub const SIGNATURE_LEN: usize = 44;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("signing key is not set")]
    KeyUnset,

    #[error("bad signature")]
    BadSignature,
}

/// Signs and verifies named values with a process-wide key.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, SigningError> {
        let key = key.into();
        if key.is_empty() {
            return Err(SigningError::KeyUnset);
        }
        let mac = HmacSha256::new_from_slice(&key).map_err(|_| SigningError::KeyUnset)?;
        Ok(Self { mac })
    }

    fn mac(&self, name: &str, value: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(name.as_bytes());
        mac.update(value.as_bytes());
        mac
    }

    pub fn write_signed(&self, name: &str, value: &str) -> String {
        let signature = STANDARD.encode(self.mac(name, value).finalize().into_bytes());
        format!("{signature}{value}")
    }

    pub fn verify_signed(&self, name: &str, signed: &str) -> Result<String, SigningError> {
        if signed.len() < SIGNATURE_LEN || !signed.is_char_boundary(SIGNATURE_LEN) {
            return Err(SigningError::BadSignature);
        }
        let (signature, value) = signed.split_at(SIGNATURE_LEN);
        let signature = STANDARD
            .decode(signature)
            .map_err(|_| SigningError::BadSignature)?;

        self.mac(name, value)
            .verify_slice(&signature)
            .map_err(|_| SigningError::BadSignature)?;

        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Signer {
        Signer::new("test-key").unwrap()
    }

    #[test]
    fn test_round_trip() {
        let s = signer();
        let signed = s.write_signed("session_id", "abc123");
        assert_eq!(signed.len(), SIGNATURE_LEN + 6);
        assert_eq!(s.verify_signed("session_id", &signed).unwrap(), "abc123");
    }

    #[test]
    fn test_every_tampered_byte_is_rejected() {
        let s = signer();
        let signed = s.write_signed("session_id", "abc123");
        for i in 0..signed.len() {
            let mut bytes = signed.clone().into_bytes();
            bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
            let tampered = String::from_utf8(bytes).unwrap();
            assert_eq!(
                s.verify_signed("session_id", &tampered),
                Err(SigningError::BadSignature),
                "byte {i} accepted"
            );
        }
    }

    #[test]
    fn test_name_is_bound() {
        let s = signer();
        let signed = s.write_signed("ticket", "sub:conn");
        assert!(s.verify_signed("session_id", &signed).is_err());
    }

    #[test]
    fn test_short_values_rejected() {
        assert_eq!(
            signer().verify_signed("session_id", "short"),
            Err(SigningError::BadSignature)
        );
    }

    #[test]
    fn test_empty_key_fails() {
        assert_eq!(Signer::new("").unwrap_err(), SigningError::KeyUnset);
    }
}
