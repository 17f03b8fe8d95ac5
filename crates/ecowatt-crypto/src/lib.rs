//! EcoWatt Crypto -- HMAC-SHA256 envelope, token generation, SHA-256 helper.
//!
//! Every upload and reply travels as `{nonce, payload, mac}`:
//! - nonce: milliseconds since the epoch at wrap time
//! - payload: compact JSON, base64-encoded or raw depending on [`PayloadMode`]
//! - mac: lower-case hex of HMAC-SHA256(psk, "{nonce}.{payload}")
//!
//! The envelope never looks inside the payload. Freshness is not checked
//! here; callers that want replay rejection track nonces themselves.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("partial envelope: nonce, payload and mac must appear together")]
    Partial,
    #[error("nonce is not an integer")]
    BadNonce,
    #[error("mac mismatch")]
    BadMac,
    #[error("payload could not be decoded: {0}")]
    BadPayload(String),
    #[error("nonce {nonce} not newer than {last}")]
    StaleNonce { nonce: i64, last: i64 },
}

impl EnvelopeError {
    /// Error code echoed to the device.
    pub fn code(&self) -> &'static str {
        "bad-mac-or-nonce"
    }
}

/// How the payload string carries the JSON text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    #[default]
    Base64,
    Raw,
}

impl PayloadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadMode::Base64 => "base64",
            PayloadMode::Raw => "raw",
        }
    }
}

impl fmt::Display for PayloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base64" | "b64" | "1" | "true" => Ok(PayloadMode::Base64),
            "raw" | "json" | "0" | "false" => Ok(PayloadMode::Raw),
            other => Err(format!("unknown payload mode: {other}")),
        }
    }
}

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: i64,
    pub payload: String,
    pub mac: String,
}

impl Envelope {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "nonce": self.nonce,
            "payload": self.payload,
            "mac": self.mac,
        })
    }
}

/// Result of [`EnvelopeKey::unwrap`].
#[derive(Debug, Clone, PartialEq)]
pub enum Unwrapped {
    /// MAC checked against the pre-shared key.
    Verified { nonce: i64, payload: Value },
    /// Body carried none of the envelope fields and is passed through.
    Plain(Value),
}

impl Unwrapped {
    pub fn is_verified(&self) -> bool {
        matches!(self, Unwrapped::Verified { .. })
    }

    pub fn nonce(&self) -> Option<i64> {
        match self {
            Unwrapped::Verified { nonce, .. } => Some(*nonce),
            Unwrapped::Plain(_) => None,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Unwrapped::Verified { payload, .. } | Unwrapped::Plain(payload) => payload,
        }
    }

    pub fn into_payload(self) -> Value {
        match self {
            Unwrapped::Verified { payload, .. } | Unwrapped::Plain(payload) => payload,
        }
    }
}

/// Pre-shared HMAC key plus the payload mode both sides agreed on.
pub struct EnvelopeKey {
    key: hmac::Key,
    mode: PayloadMode,
}

impl EnvelopeKey {
    pub fn new(secret: &[u8], mode: PayloadMode) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            mode,
        }
    }

    pub fn mode(&self) -> PayloadMode {
        self.mode
    }

    /// Wrap `payload` with the current time as nonce.
    pub fn wrap(&self, payload: &Value) -> Envelope {
        self.wrap_with_nonce(payload, chrono::Utc::now().timestamp_millis())
    }

    pub fn wrap_with_nonce(&self, payload: &Value, nonce: i64) -> Envelope {
        let json = payload.to_string();
        let payload = match self.mode {
            PayloadMode::Base64 => BASE64.encode(json.as_bytes()),
            PayloadMode::Raw => json,
        };
        let mac = self.sign(&nonce.to_string(), &payload);
        Envelope {
            nonce,
            payload,
            mac,
        }
    }

    /// Verify and open an envelope, or pass a bare payload through.
    ///
    /// A body with none of `nonce`, `payload`, `mac` is returned as
    /// [`Unwrapped::Plain`]; a body with only some of them is rejected.
    pub fn unwrap(&self, body: &Value) -> Result<Unwrapped, EnvelopeError> {
        let Some(obj) = body.as_object() else {
            return Ok(Unwrapped::Plain(body.clone()));
        };

        let (nonce, payload, mac) = match (obj.get("nonce"), obj.get("payload"), obj.get("mac")) {
            (None, None, None) => return Ok(Unwrapped::Plain(body.clone())),
            (Some(nonce), Some(payload), Some(mac)) => (nonce, payload, mac),
            _ => return Err(EnvelopeError::Partial),
        };

        // The MAC covers the nonce exactly as the device rendered it.
        let nonce_text = match nonce {
            Value::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return Err(EnvelopeError::BadNonce),
        };
        let nonce_value: i64 = nonce_text.parse().map_err(|_| EnvelopeError::BadNonce)?;

        let payload = payload
            .as_str()
            .ok_or_else(|| EnvelopeError::BadPayload("payload is not a string".into()))?;
        let mac = mac.as_str().ok_or(EnvelopeError::BadMac)?;
        let tag = hex::decode(mac).map_err(|_| EnvelopeError::BadMac)?;

        let message = format!("{nonce_text}.{payload}");
        hmac::verify(&self.key, message.as_bytes(), &tag).map_err(|_| EnvelopeError::BadMac)?;

        let decoded = match self.mode {
            PayloadMode::Base64 => {
                let bytes = BASE64
                    .decode(payload.as_bytes())
                    .map_err(|e| EnvelopeError::BadPayload(e.to_string()))?;
                serde_json::from_slice(&bytes)
            }
            PayloadMode::Raw => serde_json::from_str(payload),
        }
        .map_err(|e| EnvelopeError::BadPayload(e.to_string()))?;

        Ok(Unwrapped::Verified {
            nonce: nonce_value,
            payload: decoded,
        })
    }

    fn sign(&self, nonce: &str, payload: &str) -> String {
        let message = format!("{nonce}.{payload}");
        hex::encode(hmac::sign(&self.key, message.as_bytes()).as_ref())
    }
}

/// Random alphanumeric token for pre-shared keys and outer auth.
pub fn generate_token(len: usize) -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// SHA-256 hash of data, returned as hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const PSK: &[u8] = b"ecowatt-demo-psk";

    #[test]
    fn test_known_vector() {
        let key = EnvelopeKey::new(PSK, PayloadMode::Base64);
        let env = key.wrap_with_nonce(&json!({"ok": true}), 1_700_000_000_000);
        assert_eq!(env.payload, "eyJvayI6dHJ1ZX0=");
        assert_eq!(
            env.mac,
            "84aba0e4a93815aae90cfab97428812dc9e85c5db726dbc80a20bc80d2b70710"
        );
    }

    #[test]
    fn test_round_trip_both_modes() {
        let payload = json!({"device_id": "EcoWatt-01", "order": ["vac1", "iac1"], "seq": 3});
        for mode in [PayloadMode::Base64, PayloadMode::Raw] {
            let key = EnvelopeKey::new(PSK, mode);
            let env = key.wrap(&payload);
            let opened = key.unwrap(&env.to_value()).unwrap();
            assert!(opened.is_verified());
            assert_eq!(opened.nonce(), Some(env.nonce));
            assert_eq!(opened.into_payload(), payload);
        }
    }

    #[test]
    fn test_raw_mode_payload_is_json_text() {
        let key = EnvelopeKey::new(PSK, PayloadMode::Raw);
        let env = key.wrap_with_nonce(&json!({"a": 1}), 5);
        assert_eq!(env.payload, r#"{"a":1}"#);
    }

    #[test]
    fn test_plain_body_passes_through() {
        let key = EnvelopeKey::new(PSK, PayloadMode::Base64);
        let body = json!({"device_id": "dev", "ts_start": 1});
        assert_eq!(key.unwrap(&body).unwrap(), Unwrapped::Plain(body));
    }

    #[test]
    fn test_partial_envelope_rejected() {
        let key = EnvelopeKey::new(PSK, PayloadMode::Base64);
        let env = key.wrap(&json!({})).to_value();

        let mut no_mac = env.clone();
        no_mac.as_object_mut().unwrap().remove("mac");
        assert!(matches!(key.unwrap(&no_mac), Err(EnvelopeError::Partial)));

        let only_nonce = json!({"nonce": 1, "device_id": "dev"});
        assert!(matches!(key.unwrap(&only_nonce), Err(EnvelopeError::Partial)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let env = EnvelopeKey::new(b"key-one", PayloadMode::Base64).wrap(&json!({"x": 1}));
        let other = EnvelopeKey::new(b"key-two", PayloadMode::Base64);
        assert!(matches!(
            other.unwrap(&env.to_value()),
            Err(EnvelopeError::BadMac)
        ));
    }

    #[test]
    fn test_string_nonce_accepted() {
        let key = EnvelopeKey::new(PSK, PayloadMode::Base64);
        let env = key.wrap_with_nonce(&json!({"x": 1}), 42);
        let body = json!({"nonce": "42", "payload": env.payload, "mac": env.mac});
        assert_eq!(key.unwrap(&body).unwrap().nonce(), Some(42));
    }

    #[test]
    fn test_uppercase_mac_accepted() {
        let key = EnvelopeKey::new(PSK, PayloadMode::Base64);
        let mut env = key.wrap(&json!({"x": 1}));
        env.mac = env.mac.to_uppercase();
        assert!(key.unwrap(&env.to_value()).is_ok());
    }

    #[test]
    fn test_malformed_fields() {
        let key = EnvelopeKey::new(PSK, PayloadMode::Base64);
        let env = key.wrap(&json!({"x": 1}));

        let float_nonce = json!({"nonce": 1.5, "payload": env.payload, "mac": env.mac});
        assert!(matches!(key.unwrap(&float_nonce), Err(EnvelopeError::BadNonce)));

        let not_hex = json!({"nonce": env.nonce, "payload": env.payload, "mac": "zz"});
        assert!(matches!(key.unwrap(&not_hex), Err(EnvelopeError::BadMac)));

        // Correct MAC over a payload that is not base64 JSON.
        let garbage = "not-json";
        let mac = key.sign("9", garbage);
        let body = json!({"nonce": 9, "payload": garbage, "mac": mac});
        assert!(matches!(key.unwrap(&body), Err(EnvelopeError::BadPayload(_))));
    }

    #[test]
    fn test_payload_mode_parse() {
        assert_eq!("base64".parse::<PayloadMode>().unwrap(), PayloadMode::Base64);
        assert_eq!("1".parse::<PayloadMode>().unwrap(), PayloadMode::Base64);
        assert_eq!("RAW".parse::<PayloadMode>().unwrap(), PayloadMode::Raw);
        assert!("hex".parse::<PayloadMode>().is_err());
    }

    #[test]
    fn test_generate_token() {
        let a = generate_token(48);
        let b = generate_token(48);
        assert_eq!(a.len(), 48);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex(b"hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    proptest! {
        #[test]
        fn prop_tampered_payload_rejected(
            seq in any::<u32>(),
            idx in any::<prop::sample::Index>(),
            replacement in b'!'..=b'~',
        ) {
            let key = EnvelopeKey::new(PSK, PayloadMode::Base64);
            let env = key.wrap(&json!({"device_id": "dev", "seq": seq}));
            let mut bytes = env.payload.clone().into_bytes();
            let i = idx.index(bytes.len());
            prop_assume!(bytes[i] != replacement);
            bytes[i] = replacement;
            let tampered = Envelope {
                payload: String::from_utf8(bytes).unwrap(),
                ..env
            };
            prop_assert!(key.unwrap(&tampered.to_value()).is_err());
        }

        #[test]
        fn prop_tampered_mac_rejected(
            seq in any::<u32>(),
            idx in any::<prop::sample::Index>(),
            nibble in 0u8..16,
        ) {
            let key = EnvelopeKey::new(PSK, PayloadMode::Raw);
            let env = key.wrap(&json!({"seq": seq}));
            let mut chars: Vec<char> = env.mac.chars().collect();
            let i = idx.index(chars.len());
            let new_char = char::from_digit(nibble as u32, 16).unwrap();
            prop_assume!(chars[i] != new_char);
            chars[i] = new_char;
            let tampered = Envelope {
                mac: chars.into_iter().collect(),
                ..env
            };
            prop_assert!(matches!(
                key.unwrap(&tampered.to_value()),
                Err(EnvelopeError::BadMac)
            ));
        }
    }
}
