use aes_gcm::aead::{OsRng, rand_core::RngCore};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{CryptoError, CryptoResult};

/// HKDF context label for 1:1 message keys.
pub const CONTEXT_MESSAGE: &[u8] = b"messenger-v1";
/// HKDF context label for group-key wrapping keys.
///
/// Distinct labels domain-separate the two key purposes: recovering a
/// message key must not yield the wrapping key derived from the same
/// shared secret, and vice versa.
pub const CONTEXT_GROUP_KEY: &[u8] = b"group-key-v1";

/// Generate an X25519 key-agreement key pair. Returns (public, private),
/// 32 bytes each.
pub fn generate_agreement_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    (public.to_bytes(), secret.to_bytes())
}

/// Generate an Ed25519 signing key pair. Returns (public, private).
pub fn generate_signing_keypair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    (signing_key.verifying_key().to_bytes(), signing_key.to_bytes())
}

/// Raw X25519 Diffie-Hellman output. Both sides of a pair derive the same
/// 32 bytes; always pass the result through `derive_key` before use.
pub fn derive_shared_secret(private_key: &[u8; 32], peer_public_key: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*private_key);
    let peer = X25519PublicKey::from(*peer_public_key);
    secret.diffie_hellman(&peer).to_bytes()
}

/// HKDF-SHA256 with the context label as info and no salt. The label is
/// mandatory — see `CONTEXT_MESSAGE` / `CONTEXT_GROUP_KEY`.
pub fn derive_key(shared_secret: &[u8; 32], context: &[u8]) -> CryptoResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(context, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// Generate a random 256-bit symmetric key.
pub fn generate_symmetric_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encode a key to base64 for transport.
pub fn key_to_base64(key: &[u8]) -> String {
    BASE64.encode(key)
}

/// Decode a 32-byte key from base64.
pub fn key_from_base64(encoded: &str) -> CryptoResult<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_secret() {
        let (alice_pub, alice_priv) = generate_agreement_keypair();
        let (bob_pub, bob_priv) = generate_agreement_keypair();

        let alice_view = derive_shared_secret(&alice_priv, &bob_pub);
        let bob_view = derive_shared_secret(&bob_priv, &alice_pub);
        assert_eq!(alice_view, bob_view);
    }

    #[test]
    fn context_labels_separate_key_domains() {
        let (_, alice_priv) = generate_agreement_keypair();
        let (bob_pub, _) = generate_agreement_keypair();
        let shared = derive_shared_secret(&alice_priv, &bob_pub);

        let message_key = derive_key(&shared, CONTEXT_MESSAGE).unwrap();
        let wrapping_key = derive_key(&shared, CONTEXT_GROUP_KEY).unwrap();
        assert_ne!(message_key, wrapping_key);
    }

    #[test]
    fn derive_key_is_deterministic() {
        let shared = [7u8; 32];
        let a = derive_key(&shared, CONTEXT_MESSAGE).unwrap();
        let b = derive_key(&shared, CONTEXT_MESSAGE).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn key_base64_roundtrip() {
        let key = generate_symmetric_key();
        let encoded = key_to_base64(&key);
        assert_eq!(key_from_base64(&encoded).unwrap(), key);
    }

    #[test]
    fn truncated_base64_key_is_rejected() {
        let key = generate_symmetric_key();
        let encoded = key_to_base64(&key[..16]);
        assert!(key_from_base64(&encoded).is_err());
    }
}
