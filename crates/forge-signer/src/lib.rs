// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bundle signing and verification.
//!
//! On first use the signer loads an RSA keypair from the configured
//! directory or generates a fresh 2048-bit pair and persists it
//! (`private.pem` owner-read/write only on POSIX). Signing covers the
//! deterministic JSON of the unsigned bundle: recursively sorted object
//! keys, arrays in order, no whitespace, hashed with SHA-256 and signed
//! with PKCS#1 v1.5. Verification re-derives the same bytes from the
//! candidate bundle minus its signature block — any byte flip anywhere in
//! the payload flips the result to `false`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use forge_core::{Bundle, ContractError, SignatureBlock, SignedBundle, sha256_hex};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// The only algorithm this signer produces or accepts.
pub const SIGNATURE_ALGORITHM: &str = "RSA-SHA256";

/// RSA modulus size for generated keypairs.
const KEY_BITS: usize = 2048;

/// File names inside the key directory.
const PRIVATE_KEY_FILE: &str = "private.pem";
/// Public half, PEM-encoded SPKI.
const PUBLIC_KEY_FILE: &str = "public.pem";

/// Errors from signer operations.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// An operation ran before [`BundleSigner::initialize`].
    #[error("signer not initialized; call initialize() first")]
    NotInitialized,
    /// Key material could not be read or written.
    #[error("key I/O failed for {path}: {source}")]
    KeyIo {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// PEM encoding or decoding failed.
    #[error("key encoding failed: {0}")]
    KeyEncoding(String),
    /// Key generation or the signature primitive failed.
    #[error("crypto operation failed: {0}")]
    Crypto(String),
    /// Canonical serialization failed.
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// JSON manipulation failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

struct LoadedKeys {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    fingerprint: String,
}

/// Signs bundles and verifies signatures.
///
/// Stateless after key load; safe to share across tasks signing
/// concurrently.
///
/// # Examples
///
/// ```no_run
/// use forge_signer::BundleSigner;
///
/// let signer = BundleSigner::new("/var/lib/forge/keys");
/// signer.initialize().unwrap();
/// assert!(signer.is_initialized());
/// ```
pub struct BundleSigner {
    key_dir: PathBuf,
    keys: Mutex<Option<LoadedKeys>>,
}

impl BundleSigner {
    /// Create a signer whose keypair lives under `key_dir`. No I/O happens
    /// until [`initialize`](Self::initialize).
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            keys: Mutex::new(None),
        }
    }

    /// Load the keypair from disk, generating and persisting a fresh one if
    /// absent. Idempotent.
    ///
    /// # Errors
    ///
    /// [`SignerError::KeyIo`] on filesystem failures,
    /// [`SignerError::KeyEncoding`] on malformed PEM,
    /// [`SignerError::Crypto`] when generation fails.
    pub fn initialize(&self) -> Result<(), SignerError> {
        let mut keys = self.keys.lock().expect("key lock poisoned");
        if keys.is_some() {
            return Ok(());
        }

        let private_path = self.key_dir.join(PRIVATE_KEY_FILE);
        let public_path = self.key_dir.join(PUBLIC_KEY_FILE);

        let private = if private_path.exists() {
            let pem = read(&private_path)?;
            debug!(target: "forge.signer", path = %private_path.display(), "loading keypair");
            RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| SignerError::KeyEncoding(e.to_string()))?
        } else {
            info!(target: "forge.signer", dir = %self.key_dir.display(), "generating RSA-2048 keypair");
            let mut rng = rand::thread_rng();
            let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
                .map_err(|e| SignerError::Crypto(e.to_string()))?;
            self.persist_keypair(&private, &private_path, &public_path)?;
            private
        };

        let public = private.to_public_key();
        let fingerprint = public_key_fingerprint(&public)?;
        *keys = Some(LoadedKeys {
            private,
            public,
            fingerprint,
        });
        Ok(())
    }

    /// Whether the keypair has been loaded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.keys.lock().expect("key lock poisoned").is_some()
    }

    /// Sign an unsigned bundle.
    ///
    /// # Errors
    ///
    /// [`SignerError::NotInitialized`] before [`initialize`](Self::initialize);
    /// [`SignerError::Crypto`] if the signature primitive fails.
    pub fn sign(&self, bundle: &Bundle) -> Result<SignedBundle, SignerError> {
        let keys = self.keys.lock().expect("key lock poisoned");
        let keys = keys.as_ref().ok_or(SignerError::NotInitialized)?;

        let payload = canonical_bundle_bytes(bundle)?;
        let signing_key = SigningKey::<Sha256>::new(keys.private.clone());
        let signature = signing_key
            .try_sign(&payload)
            .map_err(|e| SignerError::Crypto(e.to_string()))?;

        debug!(target: "forge.signer", bundle = %bundle.id, "bundle signed");
        Ok(SignedBundle {
            bundle: bundle.clone(),
            signature: SignatureBlock {
                algorithm: SIGNATURE_ALGORITHM.to_string(),
                value: BASE64.encode(signature.to_bytes()),
                signed_at: Utc::now(),
                key_id: keys.fingerprint.chars().take(16).collect(),
            },
        })
    }

    /// Verify a signed bundle against an explicit public key.
    ///
    /// Returns `Ok(false)` for any mismatch: wrong algorithm, undecodable
    /// signature, or payload bytes that differ from what was signed.
    ///
    /// # Errors
    ///
    /// Only canonicalization failures error; signature mismatches are
    /// `Ok(false)`.
    pub fn verify(
        &self,
        signed: &SignedBundle,
        public_key: &RsaPublicKey,
    ) -> Result<bool, SignerError> {
        if signed.signature.algorithm != SIGNATURE_ALGORITHM {
            return Ok(false);
        }
        let Ok(raw) = BASE64.decode(&signed.signature.value) else {
            return Ok(false);
        };
        let Ok(signature) = Signature::try_from(raw.as_slice()) else {
            return Ok(false);
        };

        let payload = canonical_signed_payload(signed)?;
        let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
        Ok(verifying_key.verify(&payload, &signature).is_ok())
    }

    /// Verify a signed bundle against this signer's own public key.
    ///
    /// # Errors
    ///
    /// [`SignerError::NotInitialized`] before [`initialize`](Self::initialize).
    pub fn verify_own(&self, signed: &SignedBundle) -> Result<bool, SignerError> {
        let public = {
            let keys = self.keys.lock().expect("key lock poisoned");
            keys.as_ref().ok_or(SignerError::NotInitialized)?.public.clone()
        };
        self.verify(signed, &public)
    }

    /// Export the public key as PEM.
    ///
    /// # Errors
    ///
    /// [`SignerError::NotInitialized`] before [`initialize`](Self::initialize).
    pub fn export_public_pem(&self) -> Result<String, SignerError> {
        let keys = self.keys.lock().expect("key lock poisoned");
        let keys = keys.as_ref().ok_or(SignerError::NotInitialized)?;
        keys.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SignerError::KeyEncoding(e.to_string()))
    }

    /// Parse a foreign public key from PEM.
    ///
    /// # Errors
    ///
    /// [`SignerError::KeyEncoding`] when the PEM does not parse.
    pub fn load_public_pem(pem: &str) -> Result<RsaPublicKey, SignerError> {
        RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| SignerError::KeyEncoding(e.to_string()))
    }

    /// SHA-256 fingerprint (hex) of this signer's public key.
    ///
    /// # Errors
    ///
    /// [`SignerError::NotInitialized`] before [`initialize`](Self::initialize).
    pub fn fingerprint(&self) -> Result<String, SignerError> {
        let keys = self.keys.lock().expect("key lock poisoned");
        Ok(keys
            .as_ref()
            .ok_or(SignerError::NotInitialized)?
            .fingerprint
            .clone())
    }

    // --- helpers ---

    fn persist_keypair(
        &self,
        private: &RsaPrivateKey,
        private_path: &Path,
        public_path: &Path,
    ) -> Result<(), SignerError> {
        std::fs::create_dir_all(&self.key_dir).map_err(|source| SignerError::KeyIo {
            path: self.key_dir.clone(),
            source,
        })?;

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| SignerError::KeyEncoding(e.to_string()))?;
        write(private_path, private_pem.as_bytes())?;
        restrict_to_owner(private_path)?;

        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SignerError::KeyEncoding(e.to_string()))?;
        write(public_path, public_pem.as_bytes())?;
        Ok(())
    }
}

impl std::fmt::Debug for BundleSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleSigner")
            .field("key_dir", &self.key_dir)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Deterministic bytes covered by a bundle signature.
fn canonical_bundle_bytes(bundle: &Bundle) -> Result<Vec<u8>, SignerError> {
    // A pre-existing `signature` key cannot occur on the typed Bundle, but
    // canonicalizing via Value keeps sign and verify byte-identical.
    let mut value = serde_json::to_value(bundle)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.remove("signature");
    }
    Ok(serde_json::to_string(&value)?.into_bytes())
}

/// The same bytes, re-derived from a candidate signed bundle.
fn canonical_signed_payload(signed: &SignedBundle) -> Result<Vec<u8>, SignerError> {
    let mut value = serde_json::to_value(signed)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.remove("signature");
    }
    Ok(serde_json::to_string(&value)?.into_bytes())
}

/// SHA-256 hex digest of a public key's DER (SPKI) encoding.
fn public_key_fingerprint(public: &RsaPublicKey) -> Result<String, SignerError> {
    let der = public
        .to_public_key_der()
        .map_err(|e| SignerError::KeyEncoding(e.to_string()))?;
    Ok(sha256_hex(der.as_bytes()))
}

fn read(path: &Path) -> Result<String, SignerError> {
    std::fs::read_to_string(path).map_err(|source| SignerError::KeyIo {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), SignerError> {
    std::fs::write(path, bytes).map_err(|source| SignerError::KeyIo {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<(), SignerError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        SignerError::KeyIo {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<(), SignerError> {
    Ok(())
}
