//! The ed25519 backend : a 32-byte public key and a detached
//! 64-byte signature, via `ed25519-dalek`.

use crate::error::CoreError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Sign `data` with a raw 32-byte secret key.
pub fn sign(data: &[u8], secret_key: &[u8; 32]) -> Vec<u8> {
    let signing_key = SigningKey::from_bytes(secret_key);
    signing_key.sign(data).to_bytes().to_vec()
}

/// Verify a detached signature against a raw 32-byte public key.
pub fn verify(data: &[u8], sig: &[u8], public_key: &[u8; 32]) -> Result<bool, CoreError> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|e| CoreError::invalid_format(format!("invalid ed25519 public key: {e}")))?;
    let sig_bytes: [u8; 64] =
        sig.try_into().map_err(|_| CoreError::invalid_format("ed25519 signature must be 64 bytes"))?;
    let signature = Signature::from_bytes(&sig_bytes);
    Ok(verifying_key.verify(data, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let secret = [7u8; 32];
        let signing_key = SigningKey::from_bytes(&secret);
        let public = signing_key.verifying_key().to_bytes();
        let sig = sign(b"hello", &secret);
        assert!(verify(b"hello", &sig, &public).unwrap());
    }

    #[test]
    fn tampered_payload_fails() {
        let secret = [7u8; 32];
        let signing_key = SigningKey::from_bytes(&secret);
        let public = signing_key.verifying_key().to_bytes();
        let sig = sign(b"hello", &secret);
        assert!(!verify(b"goodbye", &sig, &public).unwrap());
    }

    #[test]
    fn wrong_length_signature_is_a_format_error() {
        let public = SigningKey::from_bytes(&[1u8; 32]).verifying_key().to_bytes();
        assert!(verify(b"hello", &[0u8; 10], &public).is_err());
    }
}
