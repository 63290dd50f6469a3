// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signed import/export documents for moving artifacts between engines.
//!
//! A transfer document carries the owning factory name, a hex checksum,
//! and the base64 payload. The checksum is a digest over
//! `payload-bytes || shared-secret`; both engines must agree on the
//! algorithm and the secret. Verification happens before any row is
//! written on import.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{EngineError, Result};

/// Digest algorithm for transfer checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    /// SHA-256 (default).
    #[default]
    Sha256,
    /// SHA-512.
    Sha512,
}

impl DigestAlgorithm {
    /// Parse a configuration name (`sha-256` / `sha-512`).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha-256" | "sha256" => Some(Self::Sha256),
            "sha-512" | "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Hex digest over `payload || secret`.
    pub fn checksum(&self, payload: &[u8], secret: &[u8]) -> String {
        match self {
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(payload);
                hasher.update(secret);
                hex::encode(hasher.finalize())
            }
            Self::Sha512 => {
                let mut hasher = Sha512::new();
                hasher.update(payload);
                hasher.update(secret);
                hex::encode(hasher.finalize())
            }
        }
    }

    fn checksum_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// Transportable, signed representation of an artifact's bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDocument {
    /// Owning factory name; the importing engine must know it.
    #[serde(default)]
    pub factory: String,
    /// Hex digest over `payload || shared-secret`.
    #[serde(default)]
    pub checksum: String,
    /// Base64 of the serialized artifact payload.
    #[serde(default)]
    pub payload: String,
}

impl TransferDocument {
    /// Parse a document from its JSON wire form.
    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| EngineError::InvalidPayload {
            reason: format!("transfer document is not valid JSON: {}", e),
        })
    }

    /// Render the document to its JSON wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("transfer document serialization cannot fail")
    }
}

/// Build a signed document around serialized artifact bytes.
pub fn seal(
    bytes: &[u8],
    factory: &str,
    algorithm: DigestAlgorithm,
    secret: &str,
) -> TransferDocument {
    TransferDocument {
        factory: factory.to_string(),
        checksum: algorithm.checksum(bytes, secret.as_bytes()),
        payload: BASE64.encode(bytes),
    }
}

/// Verify a document and return the decoded payload bytes.
///
/// Checks run in order: checksum field shape, payload decodability,
/// checksum match, payload non-emptiness. No store access happens here;
/// the caller only persists after this returns `Ok`.
pub fn verify(
    document: &TransferDocument,
    algorithm: DigestAlgorithm,
    secret: &str,
) -> Result<Vec<u8>> {
    let checksum = document.checksum.trim();
    if checksum.len() != algorithm.checksum_len()
        || !checksum.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(EngineError::InvalidChecksum);
    }

    let bytes = BASE64
        .decode(document.payload.as_bytes())
        .map_err(|e| EngineError::InvalidPayload {
            reason: format!("payload is not valid base64: {}", e),
        })?;

    let expected = algorithm.checksum(&bytes, secret.as_bytes());
    if !checksum.eq_ignore_ascii_case(&expected) {
        return Err(EngineError::ChecksumMismatch);
    }

    if bytes.is_empty() {
        return Err(EngineError::NoData);
    }

    Ok(bytes)
}
