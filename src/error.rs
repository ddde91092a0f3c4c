//! Error types for the authenticator core.

use thiserror::Error;

/// Errors surfaced by the core to its caller.
///
/// Every recoverable failure is returned; nothing is swallowed. The PIN
/// verification path reports [`Error::PinInvalid`] for both a wrong PIN and a
/// failed decryption so the two cases are indistinguishable to the host.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No persisted blob exists. The caller must run a factory reset.
    #[error("no persisted authenticator state")]
    NotFound,

    /// The persisted blob failed to decode.
    #[error("persisted authenticator state failed to decode")]
    Corrupt,

    /// The persisted blob decoded but is marked invalid. Reset required.
    #[error("persisted authenticator state is marked invalid")]
    Invalid,

    /// AES-256-GCM tag verification failed — wrong key or tampered data.
    #[error("authenticated decryption failed")]
    AeadAuth,

    /// PIN verification failed. The retry decrement is already persisted.
    #[error("PIN is incorrect")]
    PinInvalid,

    /// PIN retries are exhausted; only a factory reset recovers the device.
    #[error("PIN retries exhausted")]
    PinBlocked,

    /// The new PIN violates the length policy.
    #[error("PIN length outside the accepted range")]
    PinPolicy,

    /// The peer's ECDH public key is off-curve or the identity point.
    #[error("peer public key is not a valid P-256 point")]
    InvalidPoint,

    /// A ciphertext or plaintext length is not a positive multiple of the
    /// cipher block size.
    #[error("input length is not a positive multiple of 16")]
    InvalidLength,

    /// A credential id was rejected before key derivation.
    #[error("credential id was not issued by this authenticator")]
    CredentialIdInvalid,

    /// The persistent store rejected a read or write.
    #[error("persistent store failure")]
    StorageError,

    /// Reserved: the platform RNG failed. Unrecoverable.
    #[error("random number generator failure")]
    InternalRng,
}
