use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// GCM tag or Ed25519 signature verification failed. Terminal for the
    /// message — never retried, never downgraded to plaintext handling.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed envelope: {0}")]
    InvalidEnvelope(String),

    #[error("encryption failed: {0}")]
    Encryption(String),
}
