/// Courier client-side cryptography.
///
/// Contract: encrypt-then-sign, verify-then-decrypt. The server never
/// calls into the `client` modules — it stores and relays envelopes
/// opaquely and only uses the codec in `envelope` for shape validation.
///
/// No forward secrecy: group keys are wrapped under a static per-pair
/// X25519 secret, so compromising a long-term private key exposes every
/// key ever wrapped with it. Inherited from the protocol, not fixed here.
pub mod envelope;
pub mod error;

#[cfg(feature = "client")]
pub mod cipher;
#[cfg(feature = "client")]
pub mod group;
#[cfg(feature = "client")]
pub mod keys;

pub use error::CryptoError;
