//! Transport codec for encrypted-message envelopes.
//!
//! The server stores and relays envelopes without ever touching plaintext;
//! this module is the one piece of the crypto crate it links. Binary
//! fields travel as base64 and the round-trip is byte-exact.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

pub const ENVELOPE_VERSION: u32 = 1;

/// One encrypted message in binary form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
    pub signature: [u8; 64],
    /// Sender's Ed25519 signing public key.
    pub sender_public_key: [u8; 32],
    pub version: u32,
}

/// Transport representation: base64 strings, safe for JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub ciphertext: String,
    pub nonce: String,
    pub signature: String,
    pub sender_public_key: String,
    pub version: u32,
}

impl Envelope {
    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            ciphertext: BASE64.encode(&self.ciphertext),
            nonce: BASE64.encode(self.nonce),
            signature: BASE64.encode(self.signature),
            sender_public_key: BASE64.encode(self.sender_public_key),
            version: self.version,
        }
    }

    /// Parse and validate a wire envelope. Unknown versions are rejected
    /// outright — no best-effort parsing of formats this build does not
    /// understand.
    pub fn from_wire(wire: &WireEnvelope) -> CryptoResult<Self> {
        if wire.version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(wire.version));
        }

        let ciphertext = decode_field(&wire.ciphertext, "ciphertext")?;
        if ciphertext.is_empty() {
            return Err(CryptoError::InvalidEnvelope("empty ciphertext".into()));
        }

        let nonce: [u8; 12] = decode_field(&wire.nonce, "nonce")?
            .try_into()
            .map_err(|_| CryptoError::InvalidEnvelope("nonce must be 12 bytes".into()))?;
        let signature: [u8; 64] = decode_field(&wire.signature, "signature")?
            .try_into()
            .map_err(|_| CryptoError::InvalidEnvelope("signature must be 64 bytes".into()))?;
        let sender_public_key: [u8; 32] = decode_field(&wire.sender_public_key, "sender_public_key")?
            .try_into()
            .map_err(|_| {
                CryptoError::InvalidEnvelope("sender_public_key must be 32 bytes".into())
            })?;

        Ok(Self {
            ciphertext,
            nonce,
            signature,
            sender_public_key,
            version: wire.version,
        })
    }
}

fn decode_field(value: &str, field: &str) -> CryptoResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| CryptoError::InvalidEnvelope(format!("{field}: {e}")))
}

/// Server-side shape check for raw base64 fields arriving over REST.
/// Validates without constructing an envelope; returns the decoded bytes.
pub fn decode_envelope_fields(
    ciphertext_b64: &str,
    nonce_b64: &str,
    signature_b64: &str,
) -> CryptoResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let ciphertext = decode_field(ciphertext_b64, "ciphertext")?;
    if ciphertext.is_empty() {
        return Err(CryptoError::InvalidEnvelope("empty ciphertext".into()));
    }
    let nonce = decode_field(nonce_b64, "nonce")?;
    if nonce.len() != 12 {
        return Err(CryptoError::InvalidEnvelope("nonce must be 12 bytes".into()));
    }
    let signature = decode_field(signature_b64, "signature")?;
    if signature.len() != 64 {
        return Err(CryptoError::InvalidEnvelope("signature must be 64 bytes".into()));
    }
    Ok((ciphertext, nonce, signature))
}
