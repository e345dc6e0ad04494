//! Key module for content keys delivered in ClearKey license responses.
//!
//! Keys travel as JSON Web Keys (`kty: "oct"`) with base64url `kid` and `k`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::{b64url_decode, b64url_encode};

/// A decrypted content key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    /// Key ID bytes.
    pub kid: Vec<u8>,
    /// Key bytes.
    pub key: Vec<u8>,
}

/// A symmetric JSON Web Key as carried in ClearKey license messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    pub k: String,
}

/// A JSON Web Key set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
}

impl Key {
    /// Create a new Key.
    pub fn new(kid: Vec<u8>, key: Vec<u8>) -> Self {
        Self { kid, key }
    }

    /// Load a Key from a JWK.
    ///
    /// Only `oct` keys are accepted; both `kid` and `k` must decode to
    /// non-empty byte strings.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        if jwk.kty != "oct" {
            return Err(Error::InvalidInput(format!(
                "Unsupported JWK key type: {}",
                jwk.kty
            )));
        }

        let kid = b64url_decode(&jwk.kid)?;
        let key = b64url_decode(&jwk.k)?;
        if kid.is_empty() || key.is_empty() {
            return Err(Error::InvalidInput("JWK kid and k must not be empty".to_string()));
        }

        Ok(Self::new(kid, key))
    }

    /// Convert to a JWK.
    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            kty: "oct".to_string(),
            kid: b64url_encode(&self.kid),
            k: b64url_encode(&self.key),
        }
    }

    /// Key ID as lowercase hex.
    #[must_use]
    pub fn kid_hex(&self) -> String {
        hex::encode(&self.kid)
    }

    /// Parse every key of a serialized JWK set.
    pub fn parse_jwk_set(data: &[u8]) -> Result<Vec<Key>> {
        let set: JwkSet = serde_json::from_slice(data)?;
        set.keys.iter().map(Key::from_jwk).collect()
    }
}

/// Serialize keys as a JWK set, the body of a ClearKey license response.
pub fn keys_to_jwk_set(keys: &[Key]) -> Result<String> {
    let set = JwkSet {
        keys: keys.iter().map(Key::to_jwk).collect(),
        session_type: Some("temporary".to_string()),
    };
    Ok(serde_json::to_string(&set)?)
}
