//! The SPKI backend : signatures verified against an ASN.1 DER
//! SubjectPublicKeyInfo blob, via the `openssl` EVP signing API.

use crate::error::CoreError;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::sign::{Signer, Verifier};

/// Payloads larger than this are refused rather than hashed; commit and
/// dirtree objects in practice never approach it.
pub const MAX_DATA_LEN: usize = 128 * 1024 * 1024;

fn check_len(data: &[u8]) -> Result<(), CoreError> {
    if data.len() > MAX_DATA_LEN {
        return Err(CoreError::invalid_format(format!("payload of {} bytes exceeds the {MAX_DATA_LEN} byte spki limit", data.len())));
    }
    Ok(())
}

/// Sign `data` with a PKCS#8 private key, producing a detached signature.
pub fn sign(data: &[u8], private_key: &PKey<openssl::pkey::Private>) -> Result<Vec<u8>, CoreError> {
    check_len(data)?;
    let mut signer = Signer::new(MessageDigest::sha256(), private_key)
        .map_err(|e| CoreError::invalid_format(format!("building spki signer: {e}")))?;
    signer.update(data).map_err(|e| CoreError::invalid_format(format!("hashing spki payload: {e}")))?;
    signer.sign_to_vec().map_err(|e| CoreError::invalid_format(format!("signing spki payload: {e}")))
}

/// Verify a detached signature against a DER SubjectPublicKeyInfo blob.
pub fn verify(data: &[u8], sig: &[u8], public_key_der: &[u8]) -> Result<bool, CoreError> {
    check_len(data)?;
    let public_key: PKey<Public> = PKey::public_key_from_der(public_key_der)
        .map_err(|e| CoreError::invalid_format(format!("invalid spki public key: {e}")))?;
    let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)
        .map_err(|e| CoreError::invalid_format(format!("building spki verifier: {e}")))?;
    verifier.update(data).map_err(|e| CoreError::invalid_format(format!("hashing spki payload: {e}")))?;
    Ok(verifier.verify(sig).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;

    #[test]
    fn roundtrip() {
        let rsa = Rsa::generate(2048).unwrap();
        let private = PKey::from_rsa(rsa).unwrap();
        let public_der = private.public_key_to_der().unwrap();

        let sig = sign(b"hello", &private).unwrap();
        assert!(verify(b"hello", &sig, &public_der).unwrap());
    }

    #[test]
    fn tampered_payload_fails() {
        let rsa = Rsa::generate(2048).unwrap();
        let private = PKey::from_rsa(rsa).unwrap();
        let public_der = private.public_key_to_der().unwrap();

        let sig = sign(b"hello", &private).unwrap();
        assert!(!verify(b"goodbye", &sig, &public_der).unwrap());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let huge = vec![0u8; MAX_DATA_LEN + 1];
        let rsa = Rsa::generate(2048).unwrap();
        let private = PKey::from_rsa(rsa).unwrap();
        assert!(sign(&huge, &private).is_err());
    }
}
