//! Sign-document construction and signature verification for secondary SP
//! replication receipts.
//!
//! A secondary acknowledges a shard by signing the Keccak-256 digest of
//! `SecondarySpSignDoc(operator, object_id, integrity_hash)` with its
//! approval key. The primary verifies by recovering the public key from the
//! 65-byte recoverable secp256k1 signature and comparing the derived address
//! against the SP's declared approval address.

use fastcrypto::error::FastCryptoError;
use fastcrypto::hash::{HashFunction, Keccak256};
use fastcrypto::secp256k1::recoverable::Secp256k1RecoverableSignature;
use fastcrypto::secp256k1::{Secp256k1KeyPair, Secp256k1PublicKey};
use fastcrypto::traits::{RecoverableSignature, RecoverableSigner, ToFromBytes};
use thiserror::Error;

use crate::model::ObjectId;

/// Length of a raw account address in bytes.
pub const ADDRESS_LENGTH: usize = 20;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("invalid account address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("signature does not resolve to approval address {expected} (recovered {recovered})")]
    SignatureMismatch { expected: String, recovered: String },

    #[error("crypto backend error: {0}")]
    Crypto(#[from] FastCryptoError),
}

/// Document a secondary signs to acknowledge one replicated shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondarySpSignDoc {
    pub sp_operator_address: String,
    pub object_id: ObjectId,
    pub integrity_hash: Vec<u8>,
}

impl SecondarySpSignDoc {
    pub fn new(sp_operator_address: &str, object_id: ObjectId, integrity_hash: &[u8]) -> Self {
        Self {
            sp_operator_address: sp_operator_address.to_string(),
            object_id,
            integrity_hash: integrity_hash.to_vec(),
        }
    }

    /// Deterministic byte encoding:
    /// `operator (20 raw bytes) || object_id as uint256 BE || integrity_hash`.
    pub fn sign_bytes(&self) -> Result<Vec<u8>, SigningError> {
        let operator = decode_address(&self.sp_operator_address)?;
        let mut bytes = Vec::with_capacity(ADDRESS_LENGTH + 32 + self.integrity_hash.len());
        bytes.extend_from_slice(&operator);
        bytes.extend_from_slice(&[0u8; 24]);
        bytes.extend_from_slice(&self.object_id.to_be_bytes());
        bytes.extend_from_slice(&self.integrity_hash);
        Ok(bytes)
    }
}

/// Keccak-256 digest, the hash secondaries sign over.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).digest
}

/// Derive the hex account address of a secp256k1 public key: the last 20
/// bytes of the Keccak-256 digest of the compressed key bytes.
pub fn address_from_public_key(public_key: &Secp256k1PublicKey) -> String {
    let digest = keccak256(public_key.as_bytes());
    hex::encode(&digest[digest.len() - ADDRESS_LENGTH..])
}

/// Decode a hex account address, tolerating a `0x` prefix.
pub fn decode_address(address: &str) -> Result<[u8; ADDRESS_LENGTH], SigningError> {
    let stripped = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(stripped).map_err(|e| SigningError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    bytes
        .try_into()
        .map_err(|_| SigningError::InvalidAddress {
            address: address.to_string(),
            reason: format!("expected {} bytes", ADDRESS_LENGTH),
        })
}

/// Produce a replication receipt signature over `sign_bytes`.
///
/// This is the secondary-side half of the protocol; the primary only
/// verifies, but test fixtures and the syncer service share this code path
/// so the two cannot drift.
pub fn sign_secondary_receipt(keypair: &Secp256k1KeyPair, sign_bytes: &[u8]) -> Vec<u8> {
    let signature = keypair.sign_recoverable_with_hash::<Keccak256>(sign_bytes);
    signature.as_ref().to_vec()
}

/// Verify that `signature` is a valid recoverable secp256k1 signature over
/// the Keccak-256 digest of `sign_bytes`, produced by the key behind
/// `approval_address`.
pub fn verify_secondary_signature(
    approval_address: &str,
    sign_bytes: &[u8],
    signature: &[u8],
) -> Result<(), SigningError> {
    // validates the declared address shape up front
    decode_address(approval_address)?;

    let signature = Secp256k1RecoverableSignature::from_bytes(signature)
        .map_err(|e| SigningError::MalformedSignature(e.to_string()))?;
    let recovered = signature.recover_with_hash::<Keccak256>(sign_bytes)?;
    let recovered_address = address_from_public_key(&recovered);

    let expected = approval_address
        .strip_prefix("0x")
        .unwrap_or(approval_address);
    if !recovered_address.eq_ignore_ascii_case(expected) {
        return Err(SigningError::SignatureMismatch {
            expected: expected.to_string(),
            recovered: recovered_address,
        });
    }
    Ok(())
}
