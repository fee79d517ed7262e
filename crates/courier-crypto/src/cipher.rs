use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload, rand_core::RngCore},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::envelope::{ENVELOPE_VERSION, Envelope};
use crate::error::{CryptoError, CryptoResult};

/// Encrypt with AES-256-GCM. Returns (ciphertext, nonce); the 12-byte
/// nonce is freshly random per call and must never be reused with the
/// same key.
pub fn encrypt(
    key: &[u8; 32],
    plaintext: &[u8],
    associated_data: Option<&[u8]>,
) -> CryptoResult<(Vec<u8>, [u8; 12])> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let payload = Payload {
        msg: plaintext,
        aad: associated_data.unwrap_or(&[]),
    };
    let ciphertext = cipher
        .encrypt(nonce, payload)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt with AES-256-GCM. Fails with `Authentication` if the GCM tag
/// does not verify.
pub fn decrypt(
    key: &[u8; 32],
    ciphertext: &[u8],
    nonce: &[u8; 12],
    associated_data: Option<&[u8]>,
) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce);

    let payload = Payload {
        msg: ciphertext,
        aad: associated_data.unwrap_or(&[]),
    };
    cipher
        .decrypt(nonce, payload)
        .map_err(|e| CryptoError::Authentication(e.to_string()))
}

/// Ed25519 signature over exactly `nonce || ciphertext [|| aad]`.
/// Covering the nonce prevents nonce-substitution across messages from
/// the same sender.
pub fn sign(
    signing_private_key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    associated_data: Option<&[u8]>,
) -> [u8; 64] {
    let signing_key = SigningKey::from_bytes(signing_private_key);
    signing_key.sign(&signed_data(nonce, ciphertext, associated_data)).to_bytes()
}

/// Verify an Ed25519 signature. Fails closed: malformed keys or
/// signatures count as verification failure, not as "unsigned".
pub fn verify(
    signing_public_key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    associated_data: Option<&[u8]>,
    signature: &[u8; 64],
) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(signing_public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(signature);
    verifying_key
        .verify(&signed_data(nonce, ciphertext, associated_data), &signature)
        .is_ok()
}

fn signed_data(nonce: &[u8; 12], ciphertext: &[u8], associated_data: Option<&[u8]>) -> Vec<u8> {
    let aad = associated_data.unwrap_or(&[]);
    let mut data = Vec::with_capacity(12 + ciphertext.len() + aad.len());
    data.extend_from_slice(nonce);
    data.extend_from_slice(ciphertext);
    data.extend_from_slice(aad);
    data
}

/// Encrypt-then-sign: produce a complete envelope in one step.
pub fn seal(
    message_key: &[u8; 32],
    signing_private_key: &[u8; 32],
    signing_public_key: &[u8; 32],
    plaintext: &[u8],
    associated_data: Option<&[u8]>,
) -> CryptoResult<Envelope> {
    let (ciphertext, nonce) = encrypt(message_key, plaintext, associated_data)?;
    let signature = sign(signing_private_key, &nonce, &ciphertext, associated_data);

    Ok(Envelope {
        ciphertext,
        nonce,
        signature,
        sender_public_key: *signing_public_key,
        version: ENVELOPE_VERSION,
    })
}

/// Verify-then-decrypt: an envelope is accepted only if its signature
/// verifies. Never decrypts a forged ciphertext — the signature check
/// comes first.
pub fn open(
    message_key: &[u8; 32],
    envelope: &Envelope,
    associated_data: Option<&[u8]>,
) -> CryptoResult<Vec<u8>> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope.version));
    }
    if !verify(
        &envelope.sender_public_key,
        &envelope.nonce,
        &envelope.ciphertext,
        associated_data,
        &envelope.signature,
    ) {
        return Err(CryptoError::Authentication(
            "envelope signature did not verify".into(),
        ));
    }
    decrypt(message_key, &envelope.ciphertext, &envelope.nonce, associated_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_signing_keypair, generate_symmetric_key};

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let message = b"meet at the usual place";

        let (ciphertext, nonce) = encrypt(&key, message, None).unwrap();
        assert_ne!(&ciphertext[..message.len().min(ciphertext.len())], message);

        let decrypted = decrypt(&key, &ciphertext, &nonce, None).unwrap();
        assert_eq!(decrypted, message);
    }

    #[test]
    fn associated_data_is_bound() {
        let key = generate_symmetric_key();
        let (ciphertext, nonce) = encrypt(&key, b"hello", Some(b"conversation-1")).unwrap();

        assert!(decrypt(&key, &ciphertext, &nonce, Some(b"conversation-2")).is_err());
        assert!(decrypt(&key, &ciphertext, &nonce, None).is_err());
        assert_eq!(
            decrypt(&key, &ciphertext, &nonce, Some(b"conversation-1")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn wrong_key_fails_closed() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let (ciphertext, nonce) = encrypt(&key1, b"secret", None).unwrap();
        let result = decrypt(&key2, &ciphertext, &nonce, None);
        assert!(matches!(result, Err(CryptoError::Authentication(_))));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = generate_symmetric_key();
        let (mut ciphertext, nonce) = encrypt(&key, b"untouched", None).unwrap();
        ciphertext[0] ^= 0x01;
        assert!(decrypt(&key, &ciphertext, &nonce, None).is_err());
    }

    #[test]
    fn signature_covers_the_nonce() {
        let (signing_pub, signing_priv) = generate_signing_keypair();
        let nonce_a = [1u8; 12];
        let nonce_b = [2u8; 12];
        let ciphertext = b"ciphertext bytes";

        let signature = sign(&signing_priv, &nonce_a, ciphertext, None);
        assert!(verify(&signing_pub, &nonce_a, ciphertext, None, &signature));
        // Swapping the nonce invalidates the signature.
        assert!(!verify(&signing_pub, &nonce_b, ciphertext, None, &signature));
    }

    #[test]
    fn verify_fails_closed_on_garbage_key() {
        let signature = [0u8; 64];
        // Not a valid curve point for most values; must be false, not panic.
        assert!(!verify(&[0xffu8; 32], &[0u8; 12], b"data", None, &signature));
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = generate_symmetric_key();
        let (signing_pub, signing_priv) = generate_signing_keypair();

        let envelope = seal(&key, &signing_priv, &signing_pub, b"hi", None).unwrap();
        assert_eq!(open(&key, &envelope, None).unwrap(), b"hi");
    }

    #[test]
    fn open_rejects_any_flipped_bit() {
        let key = generate_symmetric_key();
        let (signing_pub, signing_priv) = generate_signing_keypair();
        let envelope = seal(&key, &signing_priv, &signing_pub, b"payload", None).unwrap();

        let mut tampered = envelope.clone();
        tampered.ciphertext[0] ^= 0x80;
        assert!(open(&key, &tampered, None).is_err());

        let mut tampered = envelope.clone();
        tampered.nonce[5] ^= 0x01;
        assert!(open(&key, &tampered, None).is_err());

        let mut tampered = envelope.clone();
        tampered.signature[10] ^= 0x04;
        assert!(open(&key, &tampered, None).is_err());
    }

    #[test]
    fn open_rejects_unknown_version() {
        let key = generate_symmetric_key();
        let (signing_pub, signing_priv) = generate_signing_keypair();
        let mut envelope = seal(&key, &signing_priv, &signing_pub, b"hi", None).unwrap();
        envelope.version = 9;

        assert!(matches!(
            open(&key, &envelope, None),
            Err(CryptoError::UnsupportedVersion(9))
        ));
    }
}
