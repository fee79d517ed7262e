//! Group key distribution.
//!
//! Each conversation has one symmetric key, individually wrapped for every
//! participant under a key-encryption-key derived from the static X25519
//! pair (creator private, participant public). On participant removal the
//! conversation's key version increments and the creator issues fresh
//! wraps to the remaining members — a stale key is never reused after a
//! removal.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{CONTEXT_GROUP_KEY, derive_key, derive_shared_secret, generate_symmetric_key};

/// Wrapped blob layout: `nonce(12) || ciphertext(32 + 16 tag)`.
const WRAPPED_LEN: usize = 12 + 32 + 16;

/// Create a fresh 256-bit group key for a conversation.
pub fn create_group_key() -> [u8; 32] {
    generate_symmetric_key()
}

/// Wrap a group key for one participant. The KEK comes from the static
/// creator/participant DH secret run through HKDF with the group-key
/// context label.
pub fn wrap_group_key(
    group_key: &[u8; 32],
    participant_public_key: &[u8; 32],
    creator_private_key: &[u8; 32],
) -> CryptoResult<Vec<u8>> {
    let shared = derive_shared_secret(creator_private_key, participant_public_key);
    let wrapping_key = derive_key(&shared, CONTEXT_GROUP_KEY)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrapping_key));
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, group_key.as_slice())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(WRAPPED_LEN);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Unwrap a group key with the participant's private key and the
/// creator's public key (the other side of the same static pair).
pub fn unwrap_group_key(
    wrapped: &[u8],
    creator_public_key: &[u8; 32],
    participant_private_key: &[u8; 32],
) -> CryptoResult<[u8; 32]> {
    if wrapped.len() != WRAPPED_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "wrapped group key must be {} bytes, got {}",
            WRAPPED_LEN,
            wrapped.len()
        )));
    }

    let shared = derive_shared_secret(participant_private_key, creator_public_key);
    let wrapping_key = derive_key(&shared, CONTEXT_GROUP_KEY)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrapping_key));
    let nonce = Nonce::from_slice(&wrapped[..12]);

    let plaintext = cipher
        .decrypt(nonce, &wrapped[12..])
        .map_err(|e| CryptoError::Authentication(e.to_string()))?;

    plaintext
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("unwrapped key is not 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_agreement_keypair;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let (creator_pub, creator_priv) = generate_agreement_keypair();
        let (participant_pub, participant_priv) = generate_agreement_keypair();

        let group_key = create_group_key();
        let wrapped = wrap_group_key(&group_key, &participant_pub, &creator_priv).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_LEN);

        let unwrapped = unwrap_group_key(&wrapped, &creator_pub, &participant_priv).unwrap();
        assert_eq!(unwrapped, group_key);
    }

    #[test]
    fn wrong_participant_cannot_unwrap() {
        let (creator_pub, creator_priv) = generate_agreement_keypair();
        let (participant_pub, _) = generate_agreement_keypair();
        let (_, intruder_priv) = generate_agreement_keypair();

        let group_key = create_group_key();
        let wrapped = wrap_group_key(&group_key, &participant_pub, &creator_priv).unwrap();

        let result = unwrap_group_key(&wrapped, &creator_pub, &intruder_priv);
        assert!(result.is_err());
    }

    #[test]
    fn tampered_wrap_is_rejected() {
        let (creator_pub, creator_priv) = generate_agreement_keypair();
        let (participant_pub, participant_priv) = generate_agreement_keypair();

        let group_key = create_group_key();
        let mut wrapped = wrap_group_key(&group_key, &participant_pub, &creator_priv).unwrap();
        wrapped[20] ^= 0x01;

        assert!(unwrap_group_key(&wrapped, &creator_pub, &participant_priv).is_err());
    }

    #[test]
    fn truncated_wrap_is_rejected() {
        let (creator_pub, _) = generate_agreement_keypair();
        let (_, participant_priv) = generate_agreement_keypair();
        assert!(unwrap_group_key(&[0u8; 20], &creator_pub, &participant_priv).is_err());
    }

    #[test]
    fn rekey_produces_distinct_keys() {
        let old = create_group_key();
        let new = create_group_key();
        assert_ne!(old, new);
    }
}
