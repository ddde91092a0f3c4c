//! Cryptographic core of a FIDO2/CTAP2 authenticator.
//!
//! This crate owns the authenticator's secret state and the cryptography
//! around it:
//!
//! * bootstrapping and persisting the long-lived device state — a plaintext
//!   metadata header plus an AES-256-GCM-sealed blob holding the master
//!   secret, PIN hash and sign counter ([`state`]);
//! * deriving per-credential P-256 signing keys from the single master
//!   secret, so no credential is ever stored on the device ([`credential`]);
//! * the ECDH handshake and PIN/UV Auth Protocol Two transport — message
//!   confidentiality, integrity and pinUvAuthToken issuance
//!   ([`pin_protocol`]);
//! * the time-bounded in-memory lifecycle of that token ([`token`]).
//!
//! Everything outside those concerns — transports, the CTAP2 command
//! dispatcher, attestation assembly, user-presence gestures, the storage
//! medium — lives behind the four capabilities of the [`Env`] trait or in
//! the layers above. The core is single-threaded: one operation runs to
//! completion before the next begins, and timeouts are polled, not
//! interrupt-driven.

pub mod cose;
pub mod credential;
pub mod crypto;
pub mod env;
pub mod error;
pub mod pin_protocol;
pub mod state;
pub mod token;

pub use cose::CoseKey;
pub use env::Env;
pub use error::Error;
pub use pin_protocol::{PinProtocol, SharedSecret};
pub use state::{PublicData, SecretData, StorageKey};
pub use token::{Permissions, PinUvAuthTokenState};
