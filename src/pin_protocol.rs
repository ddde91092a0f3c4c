//! PIN/UV Auth Protocol Two: the ECDH handshake with the client platform,
//! the transport shared secret, and the pinUvAuthToken it protects.
//!
//! The authenticator side keeps an ephemeral P-256 key agreement key and a
//! 32-byte pinUvAuthToken, both regenerated at power-up. A handshake hands
//! back a 64-byte shared secret split into an HMAC half and an AES half;
//! message confidentiality is unauthenticated AES-256-CBC with a fresh IV
//! per message, and integrity rides on HMAC-SHA256 over the ciphertext.

use p256::SecretKey;
use zeroize::Zeroize;

use crate::cose::{CoseKey, COSE_ALG_ECDH_ES_HKDF_256};
use crate::crypto;
use crate::env::{self, Env};
use crate::error::Error;
use crate::token::PinUvAuthTokenState;

/// Length of the pinUvAuthToken.
pub const PIN_TOKEN_LENGTH: usize = 32;

/// Length of the derived transport secret: HMAC key plus AES key.
pub const SHARED_SECRET_LENGTH: usize = 64;

const HMAC_KEY_INFO: &[u8] = b"CTAP2 HMAC key";
const AES_KEY_INFO: &[u8] = b"CTAP2 AES key";
const IV_LENGTH: usize = 16;

/// HMAC-SHA256 under a 32-byte protocol key.
pub fn authenticate(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    crypto::hmac_sha256(key, message)
}

/// Recomputes and compares the MAC in constant time. Never signals an error,
/// so callers cannot leak the failure cause through timing.
pub fn verify(key: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    crypto::ct_eq(&authenticate(key, message), signature)
}

/// The dual-purpose transport secret: `hmac_key || aes_key`.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    secret: [u8; SHARED_SECRET_LENGTH],
}

impl SharedSecret {
    fn derive(z: &[u8; 32]) -> Self {
        let mut prk = crypto::hkdf_extract(&[0u8; 32], z);
        let mut secret = [0u8; SHARED_SECRET_LENGTH];
        crypto::hkdf_expand(&prk, HMAC_KEY_INFO, &mut secret[..32]);
        crypto::hkdf_expand(&prk, AES_KEY_INFO, &mut secret[32..]);
        prk.zeroize();
        Self { secret }
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LENGTH] {
        &self.secret
    }

    /// First half of the secret, keying HMAC-SHA256.
    pub fn hmac_key(&self) -> &[u8; 32] {
        self.secret[..32]
            .try_into()
            .expect("first half of the shared secret is 32 bytes")
    }

    /// Second half of the secret, keying AES-256-CBC.
    pub fn aes_key(&self) -> &[u8; 32] {
        self.secret[32..]
            .try_into()
            .expect("second half of the shared secret is 32 bytes")
    }

    /// Encrypts a block-aligned plaintext under a fresh random IV. Output
    /// framing is always `iv || ct`.
    pub fn encrypt<E: Env + ?Sized>(&self, env: &mut E, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let iv: [u8; IV_LENGTH] = env::random_array(env);
        let ciphertext = crypto::aes256_cbc_encrypt(self.aes_key(), &iv, plaintext)?;
        let mut out = Vec::with_capacity(IV_LENGTH + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts an `iv || ct` message. Unauthenticated by design; integrity
    /// is the caller's HMAC over the ciphertext. Only the framing can fail.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.len() < IV_LENGTH + crypto::BLOCK_LENGTH {
            return Err(Error::InvalidLength);
        }
        let iv: [u8; IV_LENGTH] = data[..IV_LENGTH]
            .try_into()
            .expect("iv slice is 16 bytes");
        crypto::aes256_cbc_decrypt(self.aes_key(), &iv, &data[IV_LENGTH..])
    }

    /// HMAC-SHA256 under the HMAC half of the secret.
    pub fn authenticate(&self, message: &[u8]) -> [u8; 32] {
        authenticate(self.hmac_key(), message)
    }

    /// Constant-time verification under the HMAC half of the secret.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify(self.hmac_key(), message, signature)
    }
}

/// The authenticator side of PIN/UV Auth Protocol Two.
pub struct PinProtocol {
    key_agreement_key: SecretKey,
    pin_uv_auth_token: [u8; PIN_TOKEN_LENGTH],
    token_state: PinUvAuthTokenState,
}

impl PinProtocol {
    /// Runs at power-up: fresh key agreement key, fresh token, idle state.
    pub fn new<E: Env + ?Sized>(env: &mut E) -> Self {
        Self {
            key_agreement_key: crypto::random_p256_secret(env),
            pin_uv_auth_token: env::random_array(env),
            token_state: PinUvAuthTokenState::new(),
        }
    }

    /// Replaces the key agreement key and wipes the token bytes. Does not by
    /// itself leave the in-use state; callers that regenerate normally also
    /// call `token_state_mut().stop_using()`.
    pub fn regenerate<E: Env + ?Sized>(&mut self, env: &mut E) {
        self.key_agreement_key = crypto::random_p256_secret(env);
        self.pin_uv_auth_token.zeroize();
        log::debug!("key agreement key regenerated");
    }

    /// Draws a fresh pinUvAuthToken.
    pub fn reset_pin_uv_auth_token<E: Env + ?Sized>(&mut self, env: &mut E) {
        self.pin_uv_auth_token.zeroize();
        env.fill_random(&mut self.pin_uv_auth_token);
    }

    /// The authenticator's key agreement key as a COSE_Key
    /// (ECDH-ES+HKDF-256).
    pub fn get_public_key(&self) -> CoseKey {
        CoseKey::from_public_key(&self.key_agreement_key.public_key())
    }

    /// CBOR encoding of [`PinProtocol::get_public_key`].
    pub fn get_public_key_bytes(&self) -> Vec<u8> {
        self.get_public_key().to_bytes(COSE_ALG_ECDH_ES_HKDF_256)
    }

    /// Runs the handshake against the platform's COSE key and derives the
    /// transport secret. Off-curve and identity peer points abort with
    /// [`Error::InvalidPoint`] without touching any state.
    pub fn ecdh(&self, peer: &CoseKey) -> Result<SharedSecret, Error> {
        let mut z = crypto::p256_ecdh(&self.key_agreement_key, &peer.x, &peer.y)?;
        let shared = SharedSecret::derive(&z);
        z.zeroize();
        Ok(shared)
    }

    /// The current pinUvAuthToken, for encryption to the platform after a
    /// successful PIN exchange.
    pub fn pin_uv_auth_token(&self) -> &[u8; PIN_TOKEN_LENGTH] {
        &self.pin_uv_auth_token
    }

    /// Verifies a MAC made with the pinUvAuthToken. Always false while the
    /// token is not in use.
    pub fn verify_pin_uv_auth_token(&self, message: &[u8], signature: &[u8]) -> bool {
        if !self.token_state.is_in_use() {
            return false;
        }
        verify(&self.pin_uv_auth_token, message, signature)
    }

    pub fn token_state(&self) -> &PinUvAuthTokenState {
        &self.token_state
    }

    pub fn token_state_mut(&mut self) -> &mut PinUvAuthTokenState {
        &mut self.token_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test::TestEnv;
    use crate::state::{self, DEFAULT_PIN};
    use crate::token::Permissions;
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    /// Platform half of the handshake, computed independently with p256.
    struct Platform {
        secret: SecretKey,
    }

    impl Platform {
        fn new(env: &mut TestEnv) -> Self {
            Self {
                secret: crypto::random_p256_secret(env),
            }
        }

        fn cose_key(&self) -> CoseKey {
            CoseKey::from_public_key(&self.secret.public_key())
        }

        fn shared_secret(&self, authenticator_key: &CoseKey) -> SharedSecret {
            let z = crypto::p256_ecdh(&self.secret, &authenticator_key.x, &authenticator_key.y)
                .unwrap();
            SharedSecret::derive(&z)
        }
    }

    #[test]
    fn handshake_agrees_on_both_sides() {
        let mut env = TestEnv::new();
        let protocol = PinProtocol::new(&mut env);
        let platform = Platform::new(&mut env);

        let authenticator_side = protocol.ecdh(&platform.cose_key()).unwrap();
        let platform_side = platform.shared_secret(&protocol.get_public_key());

        assert_eq!(authenticator_side.as_bytes(), platform_side.as_bytes());
        assert_ne!(authenticator_side.hmac_key(), authenticator_side.aes_key());
    }

    #[test]
    fn handshake_rejects_invalid_peer_point() {
        let mut env = TestEnv::new();
        let protocol = PinProtocol::new(&mut env);
        let bogus = CoseKey {
            x: [0u8; 32],
            y: [0u8; 32],
        };
        assert!(matches!(protocol.ecdh(&bogus), Err(Error::InvalidPoint)));
    }

    #[test]
    fn transport_encryption_round_trips_with_iv_framing() {
        let mut env = TestEnv::new();
        let protocol = PinProtocol::new(&mut env);
        let platform = Platform::new(&mut env);
        let shared = protocol.ecdh(&platform.cose_key()).unwrap();

        let plaintext = [0xC3u8; 64];
        let message = shared.encrypt(&mut env, &plaintext).unwrap();
        assert_eq!(message.len(), 16 + 64);
        assert_eq!(shared.decrypt(&message).unwrap(), plaintext.to_vec());

        // A second encryption of the same plaintext uses a fresh IV.
        let message2 = shared.encrypt(&mut env, &plaintext).unwrap();
        assert_ne!(message[..16], message2[..16]);
    }

    #[test]
    fn transport_encryption_refuses_misaligned_lengths() {
        let mut env = TestEnv::new();
        let protocol = PinProtocol::new(&mut env);
        let platform = Platform::new(&mut env);
        let shared = protocol.ecdh(&platform.cose_key()).unwrap();

        assert_eq!(
            shared.encrypt(&mut env, &[0u8; 15]).unwrap_err(),
            Error::InvalidLength
        );
        assert_eq!(shared.encrypt(&mut env, &[]).unwrap_err(), Error::InvalidLength);
        assert_eq!(shared.decrypt(&[0u8; 16]).unwrap_err(), Error::InvalidLength);
        assert_eq!(shared.decrypt(&[0u8; 33]).unwrap_err(), Error::InvalidLength);
    }

    #[test]
    fn shared_secret_mac_verifies_and_rejects_tampering() {
        let mut env = TestEnv::new();
        let protocol = PinProtocol::new(&mut env);
        let platform = Platform::new(&mut env);
        let shared = protocol.ecdh(&platform.cose_key()).unwrap();

        let message = b"ciphertext under authentication";
        let mac = shared.authenticate(message);
        assert!(shared.verify(message, &mac));

        let mut tampered = mac;
        tampered[24] ^= 0x09;
        assert!(!shared.verify(message, &tampered));
        assert!(!shared.verify(b"different message", &mac));
        assert!(!shared.verify(message, &mac[..16]));
    }

    #[test]
    fn token_verification_requires_in_use_state() {
        let mut env = TestEnv::new();
        let mut protocol = PinProtocol::new(&mut env);
        let token = *protocol.pin_uv_auth_token();
        let mac = authenticate(&token, b"client data hash");

        assert!(!protocol.verify_pin_uv_auth_token(b"client data hash", &mac));

        protocol
            .token_state_mut()
            .begin_using(true, 0, state::StorageKey([0u8; 32]));
        assert!(protocol.verify_pin_uv_auth_token(b"client data hash", &mac));
        assert!(!protocol.verify_pin_uv_auth_token(b"other data", &mac));

        protocol.token_state_mut().stop_using();
        assert!(!protocol.verify_pin_uv_auth_token(b"client data hash", &mac));
    }

    #[test]
    fn regenerate_rotates_key_and_wipes_token() {
        let mut env = TestEnv::new();
        let mut protocol = PinProtocol::new(&mut env);
        let public_before = protocol.get_public_key();
        let token_before = *protocol.pin_uv_auth_token();

        protocol.regenerate(&mut env);
        assert_ne!(protocol.get_public_key(), public_before);
        assert_eq!(protocol.pin_uv_auth_token(), &[0u8; PIN_TOKEN_LENGTH]);

        protocol.reset_pin_uv_auth_token(&mut env);
        assert_ne!(protocol.pin_uv_auth_token(), &[0u8; PIN_TOKEN_LENGTH]);
        assert_ne!(protocol.pin_uv_auth_token(), &token_before);
    }

    // Full protocol run: handshake, encrypted PIN proof, token issuance, and
    // an authenticated operation with the issued token.
    #[test]
    fn pin_uv_protocol_two_flow() {
        let mut env = TestEnv::new();
        state::reset(&mut env, 0).unwrap();
        let mut pd = state::load(&mut env).unwrap();
        let mut protocol = PinProtocol::new(&mut env);
        let platform = Platform::new(&mut env);

        // Platform and authenticator agree on the transport secret.
        let platform_shared = platform.shared_secret(&protocol.get_public_key());
        let authenticator_shared = protocol.ecdh(&platform.cose_key()).unwrap();

        // Platform sends LEFT(SHA-256(pin), 16) encrypted, MAC'd over the
        // ciphertext.
        let pin_hash = state::pin_hash(DEFAULT_PIN);
        let pin_hash_enc = platform_shared.encrypt(&mut env, &pin_hash).unwrap();
        let pin_hash_mac = platform_shared.authenticate(&pin_hash_enc);

        // Authenticator checks integrity, decrypts, and validates the PIN.
        assert!(authenticator_shared.verify(&pin_hash_enc, &pin_hash_mac));
        let received_hash = authenticator_shared.decrypt(&pin_hash_enc).unwrap();
        assert_eq!(received_hash, pin_hash.to_vec());
        let (secret, key) = state::validate_pin(&mut env, &mut pd, DEFAULT_PIN).unwrap();
        assert_eq!(secret.pin_hash(), &pin_hash);

        // Token goes in use and travels back encrypted.
        let now = env.now_ms();
        protocol.token_state_mut().begin_using(true, now, key);
        protocol
            .token_state_mut()
            .set_permissions(Permissions::MAKE_CREDENTIAL | Permissions::GET_ASSERTION);
        let token_enc = authenticator_shared
            .encrypt(&mut env, protocol.pin_uv_auth_token())
            .unwrap();
        let token = platform_shared.decrypt(&token_enc).unwrap();

        // The platform authorizes a command with the issued token.
        let client_data_hash = [0x22u8; 32];
        let token_key: [u8; 32] = token.as_slice().try_into().unwrap();
        let pin_uv_auth_param = authenticate(&token_key, &client_data_hash);
        assert!(protocol.verify_pin_uv_auth_token(&client_data_hash, &pin_uv_auth_param));
        protocol.token_state_mut().mark_used();
        assert!(protocol.token_state().get_user_verified_flag());

        // After expiry the same MAC no longer authorizes anything.
        env.advance(600_001);
        let later = env.now_ms();
        protocol.token_state_mut().observe(later);
        assert!(!protocol.verify_pin_uv_auth_token(&client_data_hash, &pin_uv_auth_param));
    }

    #[test]
    fn platform_point_coordinates_match_sec1_encoding() {
        let mut env = TestEnv::new();
        let platform = Platform::new(&mut env);
        let cose = platform.cose_key();
        let point = platform.secret.public_key().to_encoded_point(false);
        assert_eq!(cose.x.as_slice(), point.x().unwrap().as_slice());
        assert_eq!(cose.y.as_slice(), point.y().unwrap().as_slice());
    }
}
