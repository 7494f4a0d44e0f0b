//! Envelope encryption for `vaultline`.
//!
//! Every sealed value is an [`EncryptedBlob`]: a versioned JSON envelope
//! carrying the algorithm, IV, tag, ciphertext, optional associated data and
//! the key mode. The envelope shape is the compatibility boundary between
//! processes sharing a key:
//!
//! ```json
//! {"v":1,"alg":"aes-256-gcm","iv":"<b64 12B>","tag":"<b64 16B>","data":"<b64>","aad":"ctx","key_mode":"strong"}
//! ```
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit IV via `OsRng`; uniqueness
//!   comes from randomness, not from a counter.
//! - IV and tag lengths (12 and 16 bytes) are checked before any AEAD call.
//! - `aad` is stored in cleartext and authenticated, never encrypted.
//! - Expected-AAD comparison hashes both sides with SHA-256 and compares the
//!   digests in constant time.

use std::sync::Arc;

use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keys::{KeyMaterial, KeyMode, KeyResolver};

/// The only envelope version produced or accepted.
pub const ENVELOPE_VERSION: u8 = 1;

/// The only algorithm identifier produced or accepted.
pub const ALGORITHM: &str = "aes-256-gcm";

/// IV length for AES-256-GCM (96 bits).
pub const IV_LEN: usize = 12;

/// Authentication tag length for AES-256-GCM (128 bits).
pub const TAG_LEN: usize = 16;

/// The persisted envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    /// Envelope version, always 1.
    pub v: u8,
    /// Algorithm identifier, always `aes-256-gcm`.
    pub alg: String,
    /// Base64 of the 12-byte IV.
    pub iv: String,
    /// Base64 of the 16-byte tag.
    pub tag: String,
    /// Base64 of the ciphertext.
    pub data: String,
    /// Cleartext binding context, authenticated by the tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aad: Option<String>,
    /// Strength of the key that sealed this envelope. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_mode: Option<KeyMode>,
}

struct DecodedParts {
    iv: [u8; IV_LEN],
    tag: [u8; TAG_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Serialize to the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Serialization`] if serialization fails.
    pub fn to_json(&self) -> Result<String, CryptoError> {
        serde_json::to_string(self).map_err(|e| CryptoError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Parse the JSON wire form. Shape is checked here; version, algorithm
    /// and lengths are checked on decrypt.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidEnvelope`] if `raw` is not an envelope.
    pub fn from_json(raw: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(raw).map_err(|e| CryptoError::InvalidEnvelope {
            reason: e.to_string(),
        })
    }

    /// Whether a parsed JSON value carries the envelope markers
    /// (`v == 1` and `alg == "aes-256-gcm"`).
    #[must_use]
    pub fn is_envelope(value: &serde_json::Value) -> bool {
        value.get("v").and_then(serde_json::Value::as_u64) == Some(u64::from(ENVELOPE_VERSION))
            && value.get("alg").and_then(serde_json::Value::as_str) == Some(ALGORITHM)
    }

    /// The binding context, treating a blank string as absent.
    #[must_use]
    pub fn bound_aad(&self) -> Option<&str> {
        non_blank(self.aad.as_deref())
    }

    fn decode(&self) -> Result<DecodedParts, CryptoError> {
        if self.v != ENVELOPE_VERSION {
            return Err(CryptoError::InvalidEnvelope {
                reason: format!("unsupported version {}", self.v),
            });
        }
        if self.alg != ALGORITHM {
            return Err(CryptoError::InvalidEnvelope {
                reason: format!("unsupported algorithm '{}'", self.alg),
            });
        }

        let iv = decode_field("iv", &self.iv)?;
        let tag = decode_field("tag", &self.tag)?;
        let ciphertext = decode_field("data", &self.data)?;

        let iv: [u8; IV_LEN] = iv.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidEnvelope {
            reason: format!("iv must be {IV_LEN} bytes, got {}", v.len()),
        })?;
        let tag: [u8; TAG_LEN] =
            tag.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidEnvelope {
                reason: format!("tag must be {TAG_LEN} bytes, got {}", v.len()),
            })?;

        Ok(DecodedParts {
            iv,
            tag,
            ciphertext,
        })
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(value)
        .map_err(|e| CryptoError::InvalidEnvelope {
            reason: format!("{name} is not valid base64: {e}"),
        })
}

fn non_blank(aad: Option<&str>) -> Option<&str> {
    aad.filter(|s| !s.trim().is_empty())
}

fn digest_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.as_slice().ct_eq(hb.as_slice()).into()
}

/// Encrypt `plaintext` with a fresh random IV, binding `aad` if non-blank.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal(
    key: &KeyMaterial,
    plaintext: &[u8],
    aad: Option<&str>,
) -> Result<EncryptedBlob, CryptoError> {
    let aad = non_blank(aad);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad.unwrap_or_default().as_bytes(), &mut buffer)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    Ok(EncryptedBlob {
        v: ENVELOPE_VERSION,
        alg: ALGORITHM.to_owned(),
        iv: BASE64.encode(nonce),
        tag: BASE64.encode(tag),
        data: BASE64.encode(&buffer),
        aad: aad.map(str::to_owned),
        key_mode: Some(key.mode()),
    })
}

/// Decrypt `blob`, optionally requiring it to be bound to `expected_aad`.
///
/// # Errors
///
/// - [`CryptoError::InvalidEnvelope`] on bad version, algorithm, encoding,
///   or IV/tag length.
/// - [`CryptoError::AadMismatch`] if `expected_aad` is given and the blob
///   carries none or a different one.
/// - [`CryptoError::AuthenticationFailed`] if tag verification fails.
pub fn open(
    key: &KeyMaterial,
    blob: &EncryptedBlob,
    expected_aad: Option<&str>,
) -> Result<Vec<u8>, CryptoError> {
    let parts = blob.decode()?;
    open_parts(key, blob, parts, expected_aad)
}

fn open_parts(
    key: &KeyMaterial,
    blob: &EncryptedBlob,
    parts: DecodedParts,
    expected_aad: Option<&str>,
) -> Result<Vec<u8>, CryptoError> {
    let aad = blob.bound_aad();
    if let Some(expected) = non_blank(expected_aad) {
        let Some(actual) = aad else {
            return Err(CryptoError::AadMismatch {
                reason: "envelope carries no associated data",
            });
        };
        if !digest_eq(expected, actual) {
            return Err(CryptoError::AadMismatch {
                reason: "associated data does not match the expected context",
            });
        }
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut buffer = parts.ciphertext;
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&parts.iv),
            aad.unwrap_or_default().as_bytes(),
            &mut buffer,
            Tag::from_slice(&parts.tag),
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(buffer)
}

/// Policy-checked encrypt/decrypt over the process key.
///
/// Every call goes through [`KeyResolver::require_usable`], so a legacy key
/// in production (without override) is refused on both paths.
#[derive(Debug, Clone)]
pub struct EnvelopeCipher {
    keys: Arc<KeyResolver>,
}

impl EnvelopeCipher {
    #[must_use]
    pub fn new(keys: Arc<KeyResolver>) -> Self {
        Self { keys }
    }

    /// The resolver this cipher draws its key from.
    #[must_use]
    pub fn keys(&self) -> &KeyResolver {
        &self.keys
    }

    /// Serialize `payload` to JSON and seal it.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Key`] if no policy-compliant key is available.
    /// - [`CryptoError::Serialization`] if `payload` cannot be serialized.
    /// - [`CryptoError::Encryption`] if the AEAD operation fails.
    pub fn encrypt_json<T>(&self, payload: &T, aad: Option<&str>) -> Result<EncryptedBlob, CryptoError>
    where
        T: Serialize + ?Sized,
    {
        let key = self.keys.require_usable()?;
        let plaintext = Zeroizing::new(serde_json::to_vec(payload).map_err(|e| {
            CryptoError::Serialization {
                reason: e.to_string(),
            }
        })?);
        seal(key, &plaintext, aad)
    }

    /// Open `blob` and deserialize the JSON payload.
    ///
    /// # Errors
    ///
    /// Everything [`open`] returns, plus [`CryptoError::Key`] when no
    /// policy-compliant key is available and [`CryptoError::Serialization`]
    /// when the plaintext is not the expected shape.
    pub fn decrypt_json<T>(&self, blob: &EncryptedBlob, expected_aad: Option<&str>) -> Result<T, CryptoError>
    where
        T: DeserializeOwned,
    {
        let plaintext = Zeroizing::new(self.decrypt_bytes(blob, expected_aad)?);
        serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Seal raw bytes (uploaded files and other binary payloads).
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Key`] if no policy-compliant key is available.
    /// - [`CryptoError::Encryption`] if the AEAD operation fails.
    pub fn encrypt_bytes(&self, bytes: &[u8], aad: Option<&str>) -> Result<EncryptedBlob, CryptoError> {
        let key = self.keys.require_usable()?;
        seal(key, bytes, aad)
    }

    /// Open `blob` and return the raw plaintext bytes.
    ///
    /// The envelope is validated before the key is consulted.
    ///
    /// # Errors
    ///
    /// Everything [`open`] returns, plus [`CryptoError::Key`] when no
    /// policy-compliant key is available.
    pub fn decrypt_bytes(&self, blob: &EncryptedBlob, expected_aad: Option<&str>) -> Result<Vec<u8>, CryptoError> {
        let parts = blob.decode()?;
        let key = self.keys.require_usable()?;
        open_parts(key, blob, parts, expected_aad)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::Environment;
    use crate::keys::{KeySlot, resolve};

    fn strict_key(byte: u8) -> KeyMaterial {
        KeyMaterial::from_bytes([byte; 32], KeyMode::Strict, KeySlot::Primary)
    }

    fn cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(Arc::new(KeyResolver::new(
            Some(strict_key(42)),
            Environment::Development,
            false,
        )))
    }

    #[test]
    fn json_roundtrip_with_aad() {
        let cipher = cipher();
        let payload = json!({"ok": true, "n": [1, 2, 3]});
        let blob = cipher.encrypt_json(&payload, Some("ctx-A")).unwrap();
        let back: serde_json::Value = cipher.decrypt_json(&blob, Some("ctx-A")).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn json_roundtrip_without_aad() {
        let cipher = cipher();
        let blob = cipher.encrypt_json("plain string", None).unwrap();
        assert!(blob.aad.is_none());
        let back: String = cipher.decrypt_json(&blob, None).unwrap();
        assert_eq!(back, "plain string");
    }

    #[test]
    fn concrete_audit_scenario() {
        let cipher = cipher();
        let blob = cipher.encrypt_json(&json!({"ok": true}), Some("audit:v1")).unwrap();
        assert_eq!(blob.v, 1);
        assert_eq!(blob.alg, "aes-256-gcm");

        let back: serde_json::Value = cipher.decrypt_json(&blob, Some("audit:v1")).unwrap();
        assert_eq!(back, json!({"ok": true}));

        let wrong = cipher.decrypt_json::<serde_json::Value>(&blob, Some("audit:v2"));
        assert!(matches!(wrong, Err(CryptoError::AadMismatch { .. })));
    }

    #[test]
    fn wire_shape_matches_contract() {
        let blob = cipher().encrypt_json(&json!({"a": 1}), Some("ctx")).unwrap();
        let wire: serde_json::Value = serde_json::from_str(&blob.to_json().unwrap()).unwrap();
        assert_eq!(wire["v"], 1);
        assert_eq!(wire["alg"], "aes-256-gcm");
        assert_eq!(wire["aad"], "ctx");
        assert_eq!(wire["key_mode"], "strong");
        assert_eq!(BASE64.decode(wire["iv"].as_str().unwrap()).unwrap().len(), 12);
        assert_eq!(BASE64.decode(wire["tag"].as_str().unwrap()).unwrap().len(), 16);
        assert!(EncryptedBlob::is_envelope(&wire));
    }

    #[test]
    fn legacy_key_is_tagged() {
        let key = resolve(Some("passphrase"), None, false).unwrap();
        let blob = seal(&key, b"x", None).unwrap();
        assert_eq!(blob.key_mode, Some(KeyMode::Legacy));
        let wire = blob.to_json().unwrap();
        assert!(wire.contains("\"key_mode\":\"legacy\""));
        assert!(!wire.contains("\"aad\""));
    }

    #[test]
    fn envelope_without_optional_fields_parses() {
        let blob = cipher().encrypt_bytes(b"abc", None).unwrap();
        let raw = format!(
            r#"{{"v":1,"alg":"aes-256-gcm","iv":"{}","tag":"{}","data":"{}"}}"#,
            blob.iv, blob.tag, blob.data
        );
        let parsed = EncryptedBlob::from_json(&raw).unwrap();
        assert_eq!(cipher().decrypt_bytes(&parsed, None).unwrap(), b"abc");
    }

    #[test]
    fn every_ciphertext_bit_flip_is_detected() {
        let key = strict_key(1);
        let blob = seal(&key, b"tamper-evident", Some("ctx")).unwrap();
        let data = BASE64.decode(&blob.data).unwrap();
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[byte] ^= 1 << bit;
                let tampered = EncryptedBlob {
                    data: BASE64.encode(&flipped),
                    ..blob.clone()
                };
                assert!(matches!(
                    open(&key, &tampered, Some("ctx")),
                    Err(CryptoError::AuthenticationFailed)
                ));
            }
        }
    }

    #[test]
    fn every_tag_bit_flip_is_detected() {
        let key = strict_key(1);
        let blob = seal(&key, b"tamper-evident", None).unwrap();
        let tag = BASE64.decode(&blob.tag).unwrap();
        for byte in 0..tag.len() {
            for bit in 0..8 {
                let mut flipped = tag.clone();
                flipped[byte] ^= 1 << bit;
                let tampered = EncryptedBlob {
                    tag: BASE64.encode(&flipped),
                    ..blob.clone()
                };
                assert!(matches!(
                    open(&key, &tampered, None),
                    Err(CryptoError::AuthenticationFailed)
                ));
            }
        }
    }

    #[test]
    fn rewritten_aad_fails_authentication() {
        let key = strict_key(1);
        let blob = seal(&key, b"bound", Some("row:a")).unwrap();
        let moved = EncryptedBlob {
            aad: Some("row:b".to_owned()),
            ..blob
        };
        assert!(matches!(
            open(&key, &moved, None),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let blob = seal(&strict_key(1), b"secret", None).unwrap();
        assert!(matches!(
            open(&strict_key(2), &blob, None),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn expected_aad_requires_bound_aad() {
        let key = strict_key(1);
        let blob = seal(&key, b"unbound", None).unwrap();
        assert!(matches!(
            open(&key, &blob, Some("ctx")),
            Err(CryptoError::AadMismatch { .. })
        ));
    }

    #[test]
    fn blank_aad_is_treated_as_absent() {
        let key = strict_key(1);
        let blob = seal(&key, b"x", Some("   ")).unwrap();
        assert!(blob.aad.is_none());
        assert_eq!(open(&key, &blob, Some("")).unwrap(), b"x");
    }

    #[test]
    fn short_iv_rejected_before_crypto() {
        let key = strict_key(1);
        let blob = seal(&key, b"x", None).unwrap();
        let bad = EncryptedBlob {
            iv: BASE64.encode([0u8; 11]),
            ..blob
        };
        let err = open(&key, &bad, None).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidEnvelope { .. }));
        assert!(err.to_string().contains("iv must be 12 bytes"));
    }

    #[test]
    fn long_tag_rejected_before_crypto() {
        let key = strict_key(1);
        let blob = seal(&key, b"x", None).unwrap();
        let bad = EncryptedBlob {
            tag: BASE64.encode([0u8; 17]),
            ..blob
        };
        let err = open(&key, &bad, None).unwrap_err();
        assert!(err.to_string().contains("tag must be 16 bytes"));
    }

    #[test]
    fn length_checks_precede_key_policy() {
        // No key configured: a malformed envelope still reports the envelope
        // problem rather than the missing key.
        let cipher = EnvelopeCipher::new(Arc::new(KeyResolver::new(
            None,
            Environment::Development,
            false,
        )));
        let bad = EncryptedBlob {
            v: 1,
            alg: ALGORITHM.to_owned(),
            iv: BASE64.encode([0u8; 8]),
            tag: BASE64.encode([0u8; 16]),
            data: String::new(),
            aad: None,
            key_mode: None,
        };
        assert!(matches!(
            cipher.decrypt_bytes(&bad, None),
            Err(CryptoError::InvalidEnvelope { .. })
        ));
    }

    #[test]
    fn unknown_version_and_algorithm_rejected() {
        let key = strict_key(1);
        let blob = seal(&key, b"x", None).unwrap();
        let v2 = EncryptedBlob {
            v: 2,
            ..blob.clone()
        };
        assert!(matches!(
            open(&key, &v2, None),
            Err(CryptoError::InvalidEnvelope { .. })
        ));
        let cbc = EncryptedBlob {
            alg: "aes-256-cbc".to_owned(),
            ..blob
        };
        assert!(matches!(
            open(&key, &cbc, None),
            Err(CryptoError::InvalidEnvelope { .. })
        ));
    }

    #[test]
    fn invalid_base64_rejected() {
        let key = strict_key(1);
        let blob = seal(&key, b"x", None).unwrap();
        let bad = EncryptedBlob {
            data: "***".to_owned(),
            ..blob
        };
        assert!(matches!(
            open(&key, &bad, None),
            Err(CryptoError::InvalidEnvelope { .. })
        ));
    }

    #[test]
    fn fresh_iv_per_call() {
        let key = strict_key(1);
        let a = seal(&key, b"same", None).unwrap();
        let b = seal(&key, b"same", None).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn bytes_roundtrip_with_binary_payload() {
        let cipher = cipher();
        let payload: Vec<u8> = (0..=255).collect();
        let blob = cipher.encrypt_bytes(&payload, Some("upload:42")).unwrap();
        assert_eq!(cipher.decrypt_bytes(&blob, Some("upload:42")).unwrap(), payload);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let cipher = cipher();
        let blob = cipher.encrypt_bytes(b"", None).unwrap();
        assert!(cipher.decrypt_bytes(&blob, None).unwrap().is_empty());
    }

    #[test]
    fn weak_key_refused_in_production() {
        let key = resolve(Some("passphrase"), None, false).unwrap();
        let cipher = EnvelopeCipher::new(Arc::new(KeyResolver::new(
            Some(key),
            Environment::Production,
            false,
        )));
        let err = cipher.encrypt_json(&json!({}), None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WeakKeyRejected);
    }

    #[test]
    fn payload_shape_mismatch_is_serialization_error() {
        let cipher = cipher();
        let blob = cipher.encrypt_json(&json!({"a": 1}), None).unwrap();
        let result = cipher.decrypt_json::<Vec<u32>>(&blob, None);
        assert!(matches!(result, Err(CryptoError::Serialization { .. })));
    }
}
