//! COSE_Key encoding for P-256 public keys, in CTAP2 canonical CBOR form.
//!
//! Two algorithm identifiers appear on the wire: ECDH-ES+HKDF-256 (-25) for
//! the key-agreement key handed out during the PIN/UV handshake, and ES256
//! (-7) for derived credential public keys.

use ciborium::{
    ser::into_writer,
    value::{Integer, Value},
};
use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey};
use std::cmp::Ordering;

use crate::error::Error;

/// COSE key type for double-coordinate elliptic curve keys.
pub const COSE_KTY_EC2: i64 = 2;

/// COSE curve identifier for NIST P-256.
pub const COSE_CRV_P256: i64 = 1;

/// COSE algorithm identifier for ECDSA-P256-SHA256.
pub const COSE_ALG_ES256: i64 = -7;

/// COSE algorithm identifier for ECDH-ES + HKDF-256.
pub const COSE_ALG_ECDH_ES_HKDF_256: i64 = -25;

fn canonical_key_cmp(left: &Value, right: &Value) -> Ordering {
    use Value::{Bytes, Integer as IntValue, Text};

    match (left, right) {
        (IntValue(left_int), IntValue(right_int)) => left_int.canonical_cmp(right_int),
        (IntValue(_), Text(_)) => Ordering::Less,
        (Text(_), IntValue(_)) => Ordering::Greater,
        (Text(left_text), Text(right_text)) => match left_text.len().cmp(&right_text.len()) {
            Ordering::Equal => left_text.cmp(right_text),
            other => other,
        },
        (Bytes(left_bytes), Bytes(right_bytes)) => match left_bytes.len().cmp(&right_bytes.len()) {
            Ordering::Equal => left_bytes.cmp(right_bytes),
            other => other,
        },
        _ => Ordering::Equal,
    }
}

/// Builds a CBOR map sorted in CTAP2 canonical key order.
pub fn canonical_map(mut entries: Vec<(Value, Value)>) -> Value {
    entries.sort_by(|(left, _), (right, _)| canonical_key_cmp(left, right));
    Value::Map(entries)
}

fn map_get<'a>(entries: &'a [(Value, Value)], label: i64) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(key, _)| *key == Value::Integer(Integer::from(label)))
        .map(|(_, value)| value)
}

fn coordinate(entries: &[(Value, Value)], label: i64) -> Result<[u8; 32], Error> {
    let Some(Value::Bytes(bytes)) = map_get(entries, label) else {
        return Err(Error::InvalidPoint);
    };
    bytes.as_slice().try_into().map_err(|_| Error::InvalidPoint)
}

/// An EC2 COSE_Key on P-256: uncompressed affine coordinates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoseKey {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl CoseKey {
    /// Captures the affine coordinates of a validated public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let point = public_key.to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(point.x().expect("uncompressed point has x").as_slice());
        y.copy_from_slice(point.y().expect("uncompressed point has y").as_slice());
        Self { x, y }
    }

    /// Reconstructs the P-256 point, rejecting off-curve coordinates and the
    /// identity with [`Error::InvalidPoint`].
    pub fn public_key(&self) -> Result<PublicKey, Error> {
        let mut encoded = [0u8; 65];
        encoded[0] = 0x04;
        encoded[1..33].copy_from_slice(&self.x);
        encoded[33..65].copy_from_slice(&self.y);
        PublicKey::from_sec1_bytes(&encoded).map_err(|_| Error::InvalidPoint)
    }

    /// Encodes the key as a canonical COSE_Key map under the given algorithm.
    pub fn to_value(&self, alg: i64) -> Value {
        canonical_map(vec![
            (
                Value::Integer(Integer::from(1)),
                Value::Integer(Integer::from(COSE_KTY_EC2)),
            ),
            (
                Value::Integer(Integer::from(3)),
                Value::Integer(Integer::from(alg)),
            ),
            (
                Value::Integer(Integer::from(-1)),
                Value::Integer(Integer::from(COSE_CRV_P256)),
            ),
            (Value::Integer(Integer::from(-2)), Value::Bytes(self.x.to_vec())),
            (Value::Integer(Integer::from(-3)), Value::Bytes(self.y.to_vec())),
        ])
    }

    /// CBOR-encodes [`CoseKey::to_value`].
    pub fn to_bytes(&self, alg: i64) -> Vec<u8> {
        let mut out = Vec::new();
        into_writer(&self.to_value(alg), &mut out).expect("COSE key encoding cannot fail");
        out
    }

    /// Parses a peer COSE_Key map, extracting the coordinates.
    ///
    /// Curve membership is not checked here; [`CoseKey::public_key`] does
    /// that on use.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let Value::Map(entries) = value else {
            return Err(Error::InvalidPoint);
        };
        Ok(Self {
            x: coordinate(entries, -2)?,
            y: coordinate(entries, -3)?,
        })
    }
}
