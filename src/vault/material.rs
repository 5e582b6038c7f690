//! Credential material and its integrity rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::IntegrityError;

/// Length of every curve key buffer.
pub const KEY_LEN: usize = 32;
/// Length of a pre-key signature.
pub const SIGNATURE_LEN: usize = 64;

/// A public/private key pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "b64")]
    pub public: Vec<u8>,
    #[serde(with = "b64")]
    pub private: Vec<u8>,
}

/// A key pair signed by the identity key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKeyPair {
    pub key_pair: KeyPair,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    pub key_id: u32,
}

/// The account identity a device is linked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Network address of the linked account.
    pub id: String,
    pub name: Option<String>,
}

/// Per-agent identity and session keys.
///
/// Required sub-keys are optional at the type level so that material read
/// from disk with a missing key is reported as an integrity failure instead of
/// a parse error.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialMaterial {
    #[serde(default)]
    pub noise_key: Option<KeyPair>,
    #[serde(default)]
    pub signed_identity_key: Option<KeyPair>,
    #[serde(default)]
    pub signed_pre_key: Option<SignedKeyPair>,
    #[serde(default, with = "b64_opt")]
    pub adv_secret_key: Option<Vec<u8>>,
    #[serde(default)]
    pub registration_id: u32,
    #[serde(default)]
    pub registered: bool,
    /// Bound account identity, present once pairing completed.
    #[serde(default)]
    pub me: Option<DeviceIdentity>,
    /// Opaque per-peer session state owned by the transport.
    #[serde(default)]
    pub session_keys: BTreeMap<String, serde_json::Value>,
}

impl CredentialMaterial {
    /// Check that every required sub-key is present with its fixed length.
    pub fn validate(&self) -> Result<(), IntegrityError> {
        let noise = self
            .noise_key
            .as_ref()
            .ok_or(IntegrityError::MissingKey("noise_key"))?;
        check_pair("noise_key", noise)?;

        let identity = self
            .signed_identity_key
            .as_ref()
            .ok_or(IntegrityError::MissingKey("signed_identity_key"))?;
        check_pair("signed_identity_key", identity)?;

        let pre_key = self
            .signed_pre_key
            .as_ref()
            .ok_or(IntegrityError::MissingKey("signed_pre_key"))?;
        check_pair("signed_pre_key", &pre_key.key_pair)?;
        check_len("signed_pre_key.signature", &pre_key.signature, SIGNATURE_LEN)?;

        let adv = self
            .adv_secret_key
            .as_ref()
            .ok_or(IntegrityError::MissingKey("adv_secret_key"))?;
        check_len("adv_secret_key", adv, KEY_LEN)?;

        if self.registration_id == 0 {
            return Err(IntegrityError::MissingRegistration);
        }
        Ok(())
    }

    /// Whether pairing bound this material to an account.
    pub fn is_bound(&self) -> bool {
        self.me.as_ref().is_some_and(|me| !me.id.is_empty())
    }

    /// Bound account address, if any.
    pub fn identity(&self) -> Option<&str> {
        self.me.as_ref().map(|me| me.id.as_str())
    }
}

fn check_pair(name: &'static str, pair: &KeyPair) -> Result<(), IntegrityError> {
    check_len(name, &pair.public, KEY_LEN)?;
    check_len(name, &pair.private, KEY_LEN)
}

fn check_len(key: &'static str, bytes: &[u8], expected: usize) -> Result<(), IntegrityError> {
    if bytes.is_empty() {
        return Err(IntegrityError::MissingKey(key));
    }
    if bytes.len() != expected {
        return Err(IntegrityError::WrongLength {
            key,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("registration_id", &self.registration_id)
            .field("registered", &self.registered)
            .field("me", &self.me)
            .field("keys", &"[REDACTED]")
            .field("session_keys", &self.session_keys.len())
            .finish()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair([REDACTED])")
    }
}

impl std::fmt::Debug for SignedKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignedKeyPair(key_id={})", self.key_id)
    }
}

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    fn bytes(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    fn pair(seed: u8) -> KeyPair {
        KeyPair {
            public: bytes(seed, KEY_LEN),
            private: bytes(seed.wrapping_add(100), KEY_LEN),
        }
    }

    /// Valid material, optionally bound to an account address.
    pub(crate) fn sample_material(identity: Option<&str>) -> CredentialMaterial {
        CredentialMaterial {
            noise_key: Some(pair(1)),
            signed_identity_key: Some(pair(2)),
            signed_pre_key: Some(SignedKeyPair {
                key_pair: pair(3),
                signature: bytes(4, SIGNATURE_LEN),
                key_id: 1,
            }),
            adv_secret_key: Some(bytes(5, KEY_LEN)),
            registration_id: 4242,
            registered: identity.is_some(),
            me: identity.map(|id| DeviceIdentity {
                id: id.to_string(),
                name: Some("Agent".to_string()),
            }),
            session_keys: BTreeMap::from([(
                "peer-1".to_string(),
                serde_json::json!({"chain": 7}),
            )]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::sample_material;
    use super::*;

    #[test]
    fn test_valid_material_passes() {
        let material = sample_material(Some("15551234567@s.whatsapp.net"));
        assert_eq!(material.validate(), Ok(()));
        assert!(material.is_bound());
    }

    #[test]
    fn test_missing_sub_key_is_rejected() {
        let mut material = sample_material(None);
        material.signed_pre_key = None;
        assert_eq!(
            material.validate(),
            Err(IntegrityError::MissingKey("signed_pre_key"))
        );
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        let mut material = sample_material(None);
        if let Some(noise) = material.noise_key.as_mut() {
            noise.private.truncate(31);
        }
        assert_eq!(
            material.validate(),
            Err(IntegrityError::WrongLength {
                key: "noise_key",
                expected: KEY_LEN,
                actual: 31
            })
        );
    }

    #[test]
    fn test_json_with_missing_key_parses_but_fails_validation() {
        let mut value = serde_json::to_value(sample_material(None)).unwrap();
        value.as_object_mut().unwrap().remove("adv_secret_key");
        let parsed: CredentialMaterial = serde_json::from_value(value).unwrap();
        assert_eq!(
            parsed.validate(),
            Err(IntegrityError::MissingKey("adv_secret_key"))
        );
    }

    #[test]
    fn test_debug_redacts_keys() {
        let rendered = format!("{:?}", sample_material(None));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("private"));
    }
}
