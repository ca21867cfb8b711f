//! The signature envelope : one shape — `sign`/`verify` — over
//! three backends with independent key material and wire formats.

pub mod ed25519;
pub mod gpg;
pub mod spki;

use crate::codec::{Reader, Writer};
use crate::error::CoreError;

/// A detached signature, tagged by the backend that produced it. The
/// tag doubles as the commit metadata key it's stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    /// `ostree.sign.ed25519`.
    Ed25519(Vec<u8>),
    /// `ostree.sign.spki`.
    Spki(Vec<u8>),
    /// `ostree.sign.gpg`.
    Gpg(Vec<u8>),
}

impl Signature {
    /// The commit metadata key this signature is stored under.
    pub fn metadata_key(&self) -> &'static str {
        match self {
            Signature::Ed25519(_) => "ostree.sign.ed25519",
            Signature::Spki(_) => "ostree.sign.spki",
            Signature::Gpg(_) => "ostree.sign.gpg",
        }
    }

    /// The raw signature bytes.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Signature::Ed25519(b) | Signature::Spki(b) | Signature::Gpg(b) => b,
        }
    }
}

/// A trusted public key, tagged by backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Raw 32-byte ed25519 public key.
    Ed25519([u8; 32]),
    /// ASN.1 DER SubjectPublicKeyInfo.
    Spki(Vec<u8>),
    /// An exported GPG public key (binary or ASCII-armored).
    Gpg(Vec<u8>),
}

/// The outcome of [`verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// At least one signature verified against a non-revoked key.
    Valid,
    /// No signature verified; carries a human-readable reason.
    Invalid(String),
}

/// A set of public keys that must not be trusted even if a signature
/// against one of them is cryptographically sound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevokedKeys(Vec<PublicKey>);

impl RevokedKeys {
    /// Build a revocation set from the given keys.
    pub fn new(keys: Vec<PublicKey>) -> Self {
        Self(keys)
    }

    /// An empty revocation set.
    pub fn none() -> Self {
        Self::default()
    }

    fn contains(&self, key: &PublicKey) -> bool {
        self.0.contains(key)
    }
}

/// Secret key material for producing a [`Signature`]. Only the backends
/// this implementation can sign in-process are represented here; GPG
/// signing is left to whatever process holds the secret keyring.
#[derive(Debug)]
pub enum SigningKey {
    /// Raw 32-byte ed25519 secret key.
    Ed25519([u8; 32]),
    /// An OpenSSL private key used with the spki backend.
    Spki(openssl::pkey::PKey<openssl::pkey::Private>),
}

/// Produce one [`Signature`] per signing key.
pub fn sign_with(data: &[u8], keys: &[SigningKey]) -> Result<Vec<Signature>, CoreError> {
    keys.iter()
        .map(|key| {
            Ok(match key {
                SigningKey::Ed25519(secret) => Signature::Ed25519(ed25519::sign(data, secret)),
                SigningKey::Spki(private) => Signature::Spki(spki::sign(data, private)?),
            })
        })
        .collect()
}

/// Encode a commit's signatures as the sibling `.commitmeta` contents
/// : signature-type key to list of raw signature blobs,
/// grouped and sorted by key for a canonical encoding.
pub fn encode_commitmeta(sigs: &[Signature]) -> Vec<u8> {
    let mut grouped: std::collections::BTreeMap<&'static str, Vec<&[u8]>> = std::collections::BTreeMap::new();
    for sig in sigs {
        grouped.entry(sig.metadata_key()).or_default().push(sig.bytes());
    }
    let mut w = Writer::new();
    w.u32(grouped.len() as u32);
    for (key, blobs) in grouped {
        w.string(key);
        w.u32(blobs.len() as u32);
        for blob in blobs {
            w.bytes(blob);
        }
    }
    w.into_bytes()
}

/// Decode commitmeta bytes produced by [`encode_commitmeta`].
pub fn decode_commitmeta(buf: &[u8]) -> Result<Vec<Signature>, CoreError> {
    let mut r = Reader::new(buf);
    let nkeys = r.u32()? as usize;
    let mut sigs = Vec::new();
    for _ in 0..nkeys {
        let key = r.string()?;
        let nblobs = r.u32()? as usize;
        for _ in 0..nblobs {
            let blob = r.bytes()?;
            sigs.push(match key.as_str() {
                "ostree.sign.ed25519" => Signature::Ed25519(blob),
                "ostree.sign.spki" => Signature::Spki(blob),
                "ostree.sign.gpg" => Signature::Gpg(blob),
                o => return Err(CoreError::invalid_format(format!("unknown signature key {o}"))),
            });
        }
    }
    if r.remaining() {
        return Err(CoreError::invalid_format("trailing bytes after commitmeta"));
    }
    Ok(sigs)
}

/// Apply the require-valid policy: `Valid` iff at least one of `sigs`
/// verifies against a non-revoked member of `pubkeys`. Revoked keys are
/// skipped before any cryptographic check runs, so revoking a key flips
/// the result without needing to recompute any signature.
pub fn verify(data: &[u8], sigs: &[Signature], pubkeys: &[PublicKey], revoked: &RevokedKeys) -> Result<Verdict, CoreError> {
    for sig in sigs {
        for key in pubkeys {
            if revoked.contains(key) {
                continue;
            }
            let ok = match (sig, key) {
                (Signature::Ed25519(s), PublicKey::Ed25519(k)) => ed25519::verify(data, s, k)?,
                (Signature::Spki(s), PublicKey::Spki(k)) => spki::verify(data, s, k)?,
                (Signature::Gpg(s), PublicKey::Gpg(k)) => gpg::verify(data, s, k)?,
                _ => false,
            };
            if ok {
                return Ok(Verdict::Valid);
            }
        }
    }
    Ok(Verdict::Invalid("no signature verified against a non-revoked public key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_signatures_is_invalid() {
        let v = verify(b"data", &[], &[], &RevokedKeys::none()).unwrap();
        assert_eq!(v, Verdict::Invalid("no signature verified against a non-revoked public key".to_string()));
    }

    /// Revoking the only matching key flips a valid signature to
    /// invalid without recomputing it.
    #[test]
    fn revoking_key_flips_valid_to_invalid() {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let public_key = signing_key.verifying_key().to_bytes();
        let sig = ed25519::sign(b"payload", &[9u8; 32]);

        let sigs = [Signature::Ed25519(sig)];
        let keys = [PublicKey::Ed25519(public_key)];

        let trusting = verify(b"payload", &sigs, &keys, &RevokedKeys::none()).unwrap();
        assert_eq!(trusting, Verdict::Valid);

        let revoked = RevokedKeys::new(vec![PublicKey::Ed25519(public_key)]);
        let revoked_verdict = verify(b"payload", &sigs, &keys, &revoked).unwrap();
        assert!(matches!(revoked_verdict, Verdict::Invalid(_)));
    }

    #[test]
    fn commitmeta_roundtrip() {
        let sigs = vec![
            Signature::Ed25519(vec![1u8; 64]),
            Signature::Spki(vec![2u8; 32]),
            Signature::Ed25519(vec![3u8; 64]),
        ];
        let encoded = encode_commitmeta(&sigs);
        let decoded = decode_commitmeta(&encoded).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded.contains(&Signature::Spki(vec![2u8; 32])));
        assert!(decoded.contains(&Signature::Ed25519(vec![1u8; 64])));
        assert!(decoded.contains(&Signature::Ed25519(vec![3u8; 64])));
    }

    #[test]
    fn empty_commitmeta_roundtrips() {
        let encoded = encode_commitmeta(&[]);
        assert!(decode_commitmeta(&encoded).unwrap().is_empty());
    }

    #[test]
    fn sign_with_ed25519_produces_a_verifiable_signature() {
        let keys = [SigningKey::Ed25519([4u8; 32])];
        let sigs = sign_with(b"payload", &keys).unwrap();
        let public_key = ed25519_dalek::SigningKey::from_bytes(&[4u8; 32]).verifying_key().to_bytes();
        let verdict = verify(b"payload", &sigs, &[PublicKey::Ed25519(public_key)], &RevokedKeys::none()).unwrap();
        assert_eq!(verdict, Verdict::Valid);
    }
}
