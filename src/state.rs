//! Persistent authenticator state: a plaintext metadata header plus an
//! AEAD-sealed blob holding the master secret, PIN hash, PIN length and sign
//! counter.
//!
//! The storage key is re-derived from the PIN hash on every successful PIN
//! validation and never written anywhere. The 96-bit little-endian nonce
//! counter is incremented before every seal and persisted with the
//! ciphertext, so a `(key, nonce)` pair never covers two distinct
//! plaintexts, including across reboots.

use ciborium::{de::from_reader, ser::into_writer};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto;
use crate::env::Env;
use crate::error::Error;

/// PIN installed by a factory reset.
pub const DEFAULT_PIN: &[u8] = b"candystick";

/// Retry budget granted at reset and restored by a successful validation.
pub const MAX_PIN_RETRIES: u8 = 8;

/// Minimum accepted PIN length in bytes.
pub const MIN_PIN_LENGTH: usize = 4;

/// Maximum accepted PIN length in bytes.
pub const MAX_PIN_LENGTH: usize = 63;

const SALT_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;
const PIN_HASH_LENGTH: usize = 16;
const MASTER_SECRET_LENGTH: usize = 32;

/// Plaintext metadata stored ahead of the sealed blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// False means the device needs a factory reset before use.
    pub valid: bool,
    /// HKDF salt for the storage key, fresh at every reset.
    #[serde(with = "serde_bytes")]
    pub salt: Vec<u8>,
    /// 96-bit little-endian AES-GCM nonce counter, monotone per write.
    #[serde(with = "serde_bytes")]
    pub nonce_ctr: Vec<u8>,
    /// Remaining PIN attempts, decremented before each verification.
    pub pin_retries: u8,
}

/// The full at-rest record: metadata plus the sealed [`SecretData`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicData {
    pub meta: Meta,
    #[serde(rename = "forcePINChange", default)]
    pub force_pin_change: Option<bool>,
    /// AEAD ciphertext of the CBOR-encoded [`SecretData`].
    #[serde(with = "serde_bytes")]
    pub c: Vec<u8>,
    /// Detached 16-byte AEAD tag.
    #[serde(with = "serde_bytes")]
    pub tag: Vec<u8>,
}

/// The secrets inside the ciphertext. Scrubbed on drop.
#[derive(Clone, Debug, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct SecretData {
    #[serde(with = "serde_bytes")]
    pub master_secret: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub pin_hash: Vec<u8>,
    pub pin_length: u8,
    pub sign_ctr: u32,
}

impl SecretData {
    /// The 32-byte device master secret.
    pub fn master_secret(&self) -> &[u8; MASTER_SECRET_LENGTH] {
        self.master_secret
            .as_slice()
            .try_into()
            .expect("master secret length is validated on decode")
    }

    /// `LEFT(SHA-256(PIN), 16)` of the current PIN.
    pub fn pin_hash(&self) -> &[u8; PIN_HASH_LENGTH] {
        self.pin_hash
            .as_slice()
            .try_into()
            .expect("pin hash length is validated on decode")
    }

    /// Bumps the global assertion counter. The caller persists the change
    /// through [`update_secret`].
    pub fn increment_sign_counter(&mut self) {
        self.sign_ctr = self.sign_ctr.wrapping_add(1);
    }

    fn validate(&self) -> Result<(), Error> {
        if self.master_secret.len() != MASTER_SECRET_LENGTH
            || self.pin_hash.len() != PIN_HASH_LENGTH
            || usize::from(self.pin_length) > MAX_PIN_LENGTH
        {
            return Err(Error::Corrupt);
        }
        Ok(())
    }
}

/// The AES-256-GCM key sealing [`SecretData`], derived as
/// `HKDF-extract(salt, pin_hash)`. Held in RAM only while a session is in
/// progress; scrubbed on drop.
#[derive(Clone, Debug, Zeroize)]
#[zeroize(drop)]
pub struct StorageKey(pub(crate) [u8; 32]);

impl StorageKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// `LEFT(SHA-256(pin), 16)` as CTAP2 defines the PIN hash.
pub fn pin_hash(pin: &[u8]) -> [u8; PIN_HASH_LENGTH] {
    let digest = crypto::sha256(pin);
    let mut out = [0u8; PIN_HASH_LENGTH];
    out.copy_from_slice(&digest[..PIN_HASH_LENGTH]);
    out
}

/// Derives the storage key from the persisted salt and a PIN hash.
pub fn derive_storage_key(salt: &[u8], pin_hash: &[u8; PIN_HASH_LENGTH]) -> StorageKey {
    StorageKey(crypto::hkdf_extract(salt, pin_hash))
}

fn nonce_array(nonce_ctr: &[u8]) -> Result<[u8; NONCE_LENGTH], Error> {
    nonce_ctr.try_into().map_err(|_| Error::Corrupt)
}

fn increment_nonce(nonce: &mut [u8; NONCE_LENGTH]) {
    for byte in nonce.iter_mut() {
        let (value, carry) = byte.overflowing_add(1);
        *byte = value;
        if !carry {
            break;
        }
    }
}

fn seal_secret(
    secret: &SecretData,
    key: &StorageKey,
    nonce: &[u8; NONCE_LENGTH],
) -> (Vec<u8>, Vec<u8>) {
    let mut plain = Vec::new();
    into_writer(secret, &mut plain).expect("CBOR encoding of secret data cannot fail");
    let (ciphertext, tag) = crypto::aes256_gcm_seal(key.as_bytes(), nonce, b"", &plain);
    plain.zeroize();
    (ciphertext, tag.to_vec())
}

fn validate(pd: &PublicData) -> Result<(), Error> {
    if pd.meta.salt.len() != SALT_LENGTH
        || pd.meta.nonce_ctr.len() != NONCE_LENGTH
        || pd.meta.pin_retries > MAX_PIN_RETRIES
        || pd.tag.len() != TAG_LENGTH
    {
        return Err(Error::Corrupt);
    }
    Ok(())
}

/// Serializes to the on-flash framing: `[u32_le length][CBOR]`.
pub fn serialize(pd: &PublicData) -> Vec<u8> {
    let mut cbor = Vec::new();
    into_writer(pd, &mut cbor).expect("CBOR encoding of public data cannot fail");
    let mut out = Vec::with_capacity(4 + cbor.len());
    out.extend_from_slice(&(cbor.len() as u32).to_le_bytes());
    out.extend_from_slice(&cbor);
    out
}

fn frame_body(bytes: &[u8]) -> Result<&[u8], Error> {
    if bytes.len() > 4 && (0xA0..=0xBF).contains(&bytes[4]) {
        let declared =
            u32::from_le_bytes(bytes[..4].try_into().expect("prefix is four bytes")) as usize;
        // Raw flash may pad the tail; accept any declared length that fits.
        if declared <= bytes.len() - 4 {
            return Ok(&bytes[4..4 + declared]);
        }
    }
    if bytes.first().is_some_and(|b| (0xA0..=0xBF).contains(b)) {
        log::warn!("state blob has no length prefix, reading bare CBOR");
        return Ok(bytes);
    }
    Err(Error::Corrupt)
}

/// Parses a blob produced by [`serialize`], tolerating a bare CBOR map for
/// recovery from stores that strip the length prefix.
pub fn deserialize(bytes: &[u8]) -> Result<PublicData, Error> {
    let body = frame_body(bytes)?;
    let pd: PublicData = from_reader(body).map_err(|_| Error::Corrupt)?;
    validate(&pd)?;
    Ok(pd)
}

/// Factory reset: fresh master secret and salt, the default PIN, a zeroed
/// sign counter, and the externally seeded nonce counter. Persists the new
/// record and returns it.
pub fn reset<E: Env + ?Sized>(env: &mut E, nonce_seed: u64) -> Result<PublicData, Error> {
    let mut master = [0u8; MASTER_SECRET_LENGTH];
    env.fill_random(&mut master);
    let mut salt = [0u8; SALT_LENGTH];
    env.fill_random(&mut salt);

    let mut nonce = [0u8; NONCE_LENGTH];
    nonce[..8].copy_from_slice(&nonce_seed.to_le_bytes());

    let hash = pin_hash(DEFAULT_PIN);
    let secret = SecretData {
        master_secret: master.to_vec(),
        pin_hash: hash.to_vec(),
        pin_length: DEFAULT_PIN.len() as u8,
        sign_ctr: 0,
    };
    master.zeroize();

    let key = derive_storage_key(&salt, &hash);
    let (c, tag) = seal_secret(&secret, &key, &nonce);
    let pd = PublicData {
        meta: Meta {
            valid: true,
            salt: salt.to_vec(),
            nonce_ctr: nonce.to_vec(),
            pin_retries: MAX_PIN_RETRIES,
        },
        force_pin_change: Some(true),
        c,
        tag,
    };
    env.persist_store(&serialize(&pd))?;
    log::info!("authenticator state reset to factory defaults");
    Ok(pd)
}

/// Loads the persisted record.
///
/// Fails with [`Error::NotFound`] (no blob), [`Error::Corrupt`] (decode
/// failure) or [`Error::Invalid`] (`valid == false`); callers seeing
/// `NotFound` or `Invalid` must run [`reset`].
pub fn load<E: Env + ?Sized>(env: &mut E) -> Result<PublicData, Error> {
    let blob = env.persist_load()?;
    let pd = deserialize(&blob)?;
    if !pd.meta.valid {
        return Err(Error::Invalid);
    }
    Ok(pd)
}

/// Re-seals `secret` under the next nonce and persists the record.
///
/// The nonce increment happens before the seal. If the store rejects the
/// write, the in-RAM record is reverted so RAM and flash stay consistent.
pub fn update_secret<E: Env + ?Sized>(
    env: &mut E,
    pd: &mut PublicData,
    secret: &SecretData,
    key: &StorageKey,
) -> Result<(), Error> {
    let previous = pd.clone();

    let mut nonce = nonce_array(&pd.meta.nonce_ctr)?;
    increment_nonce(&mut nonce);
    pd.meta.nonce_ctr = nonce.to_vec();
    let (c, tag) = seal_secret(secret, key, &nonce);
    pd.c = c;
    pd.tag = tag;

    if let Err(err) = env.persist_store(&serialize(pd)) {
        *pd = previous;
        return Err(err);
    }
    Ok(())
}

/// Verifies a candidate PIN against the sealed state.
///
/// The retry decrement is persisted before any decryption is attempted, so
/// pulling power mid-verification cannot win attempts back. A wrong PIN and
/// a tampered blob take the same path and report [`Error::PinInvalid`].
/// On success the retry budget is restored, the blob is re-sealed under the
/// next nonce, and the decrypted secrets plus storage key are returned.
pub fn validate_pin<E: Env + ?Sized>(
    env: &mut E,
    pd: &mut PublicData,
    pin: &[u8],
) -> Result<(SecretData, StorageKey), Error> {
    if pd.meta.pin_retries == 0 {
        return Err(Error::PinBlocked);
    }

    let remaining = pd.meta.pin_retries - 1;
    let previous = pd.meta.pin_retries;
    pd.meta.pin_retries = remaining;
    if let Err(err) = env.persist_store(&serialize(pd)) {
        pd.meta.pin_retries = previous;
        return Err(err);
    }

    let candidate = pin_hash(pin);
    let key = derive_storage_key(&pd.meta.salt, &candidate);
    let nonce = nonce_array(&pd.meta.nonce_ctr)?;
    let tag: [u8; TAG_LENGTH] = pd.tag.as_slice().try_into().map_err(|_| Error::Corrupt)?;

    let mut plain = match crypto::aes256_gcm_open(key.as_bytes(), &nonce, b"", &pd.c, &tag) {
        Ok(plain) => plain,
        Err(_) => return Err(Error::PinInvalid),
    };
    let decoded: Result<SecretData, _> = from_reader(plain.as_slice());
    plain.zeroize();
    let secret = decoded.map_err(|_| Error::Corrupt)?;
    secret.validate()?;
    if !crypto::ct_eq(&candidate, &secret.pin_hash) {
        return Err(Error::PinInvalid);
    }

    pd.meta.pin_retries = MAX_PIN_RETRIES;
    update_secret(env, pd, &secret, &key)?;
    Ok((secret, key))
}

/// Installs a new PIN into an unlocked session.
///
/// Recomputes the PIN hash, re-derives the storage key under the unchanged
/// salt, re-seals under the next nonce, restores the retry budget and clears
/// the force-change flag. Returns the new storage key.
pub fn set_pin<E: Env + ?Sized>(
    env: &mut E,
    pd: &mut PublicData,
    secret: &mut SecretData,
    new_pin: &[u8],
) -> Result<StorageKey, Error> {
    if new_pin.len() < MIN_PIN_LENGTH || new_pin.len() > MAX_PIN_LENGTH {
        return Err(Error::PinPolicy);
    }

    let hash = pin_hash(new_pin);
    let previous_meta = pd.clone();
    let previous_hash = std::mem::replace(&mut secret.pin_hash, hash.to_vec());
    let previous_length = secret.pin_length;
    secret.pin_length = new_pin.len() as u8;

    let key = derive_storage_key(&pd.meta.salt, &hash);
    pd.meta.pin_retries = MAX_PIN_RETRIES;
    pd.force_pin_change = Some(false);

    if let Err(err) = update_secret(env, pd, secret, &key) {
        *pd = previous_meta;
        let mut stale = std::mem::replace(&mut secret.pin_hash, previous_hash);
        stale.zeroize();
        secret.pin_length = previous_length;
        return Err(err);
    }
    Ok(key)
}
