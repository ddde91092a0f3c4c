//! Thin typed wrappers over the cryptographic primitives the core uses.
//!
//! Everything here is a direct mapping onto the underlying crates: P-256
//! scalar generation and ECDH, AES-256-CBC without padding for the transport
//! layer, AES-256-GCM for the at-rest blob, HKDF-SHA256, HMAC-SHA256 and
//! SHA-256. MAC outputs, PIN hashes and similar secrets are only ever
//! compared through [`ct_eq`].

use aes::Aes256;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use cbc::{
    cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit},
    Decryptor, Encryptor,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::{ecdh::diffie_hellman, PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::env::Env;
use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

/// AES block length; CBC inputs must be a positive multiple of this.
pub const BLOCK_LENGTH: usize = 16;

/// AES-256-GCM nonce length (96 bits).
pub const GCM_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length.
pub const GCM_TAG_LENGTH: usize = 16;

/// SHA-256 over `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Constant-time byte equality. False for mismatched lengths.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// HKDF-SHA256 extract step: `PRK = HMAC(salt, ikm)`.
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    prk.into()
}

/// HKDF-SHA256 expand step, filling `okm` from `prk` and `info`.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], okm: &mut [u8]) {
    let hkdf = Hkdf::<Sha256>::from_prk(prk).expect("a 32-byte PRK is always valid");
    hkdf.expand(info, okm)
        .expect("HKDF expand must not fail for valid output length");
}

/// Generates a uniformly random P-256 secret scalar, retrying the negligible
/// fraction of candidates outside `[1, n)`.
pub fn random_p256_secret<E: Env + ?Sized>(env: &mut E) -> SecretKey {
    loop {
        let mut candidate = [0u8; 32];
        env.fill_random(&mut candidate);
        let parsed = SecretKey::from_slice(&candidate);
        candidate.zeroize();
        match parsed {
            Ok(secret) => break secret,
            Err(_) => continue,
        }
    }
}

/// P-256 ECDH: validates the peer point and returns the big-endian
/// x-coordinate of the shared point.
///
/// Off-curve and identity peer points fail with [`Error::InvalidPoint`]
/// before any secret-dependent computation.
pub fn p256_ecdh(secret: &SecretKey, peer_x: &[u8; 32], peer_y: &[u8; 32]) -> Result<[u8; 32], Error> {
    let mut encoded = [0u8; 65];
    encoded[0] = 0x04;
    encoded[1..33].copy_from_slice(peer_x);
    encoded[33..65].copy_from_slice(peer_y);

    let peer = PublicKey::from_sec1_bytes(&encoded).map_err(|_| Error::InvalidPoint)?;
    let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    Ok(out)
}

fn check_block_aligned(len: usize) -> Result<(), Error> {
    if len == 0 || len % BLOCK_LENGTH != 0 {
        return Err(Error::InvalidLength);
    }
    Ok(())
}

/// AES-256-CBC encryption without padding. `plaintext` must be a positive
/// multiple of 16 bytes; misaligned input fails with [`Error::InvalidLength`].
pub fn aes256_cbc_encrypt(
    key: &[u8; 32],
    iv: &[u8; 16],
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    check_block_aligned(plaintext.len())?;
    let mut buffer = plaintext.to_vec();
    let cipher = Aes256CbcEnc::new(key.into(), iv.into());
    cipher
        .encrypt_padded_mut::<NoPadding>(&mut buffer, plaintext.len())
        .map_err(|_| Error::InvalidLength)?;
    Ok(buffer)
}

/// AES-256-CBC decryption without padding; the dual of
/// [`aes256_cbc_encrypt`].
pub fn aes256_cbc_decrypt(
    key: &[u8; 32],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    check_block_aligned(ciphertext.len())?;
    let mut buffer = ciphertext.to_vec();
    let cipher = Aes256CbcDec::new(key.into(), iv.into());
    cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| Error::InvalidLength)?;
    Ok(buffer)
}

/// AES-256-GCM seal. Returns the ciphertext and detached 16-byte tag.
pub fn aes256_gcm_seal(
    key: &[u8; 32],
    nonce: &[u8; GCM_NONCE_LENGTH],
    aad: &[u8],
    plaintext: &[u8],
) -> (Vec<u8>, [u8; GCM_TAG_LENGTH]) {
    let cipher = Aes256Gcm::new_from_slice(key).expect("AES-256 key is 32 bytes");
    let mut combined = cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("GCM encryption cannot fail for valid parameters");
    let tail = combined.split_off(combined.len() - GCM_TAG_LENGTH);
    let mut tag = [0u8; GCM_TAG_LENGTH];
    tag.copy_from_slice(&tail);
    (combined, tag)
}

/// AES-256-GCM open. Fails with [`Error::AeadAuth`] on any tag mismatch.
pub fn aes256_gcm_open(
    key: &[u8; 32],
    nonce: &[u8; GCM_NONCE_LENGTH],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; GCM_TAG_LENGTH],
) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("AES-256 key is 32 bytes");
    let mut combined = Vec::with_capacity(ciphertext.len() + GCM_TAG_LENGTH);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| Error::AeadAuth)
}
