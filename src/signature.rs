// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Capability signature codec.
//!
//! Signs and verifies the compact bearer token every privileged call must
//! present: `b64url(payload).b64url(hmac-sha256(payload))` where the payload
//! binds a session id, a device-binding id, a monotonic version number, and
//! a role, plus issuer and a short expiry.
//!
//! Verification here is purely cryptographic; it never touches storage.
//! Freshness (`exp`) and version agreement are checked by the session store
//! against the binding row, so a cryptographically valid signature whose
//! version has been rotated away still fails authentication.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::model::Role;

type HmacSha256 = Hmac<Sha256>;

/// Issuer stamped into every signature and required on verify.
pub const SIGNATURE_ISSUER: &str = "examgate-session-core";

/// Claims carried by a capability signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePayload {
    /// Session id.
    pub sid: String,
    /// Device-binding id.
    pub bid: String,
    /// Binding signature version this token was minted for.
    pub ver: u32,
    pub role: Role,
    pub iss: String,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds. Enforced by the caller, not by `verify`.
    pub exp: i64,
}

/// Codec failures. Deliberately coarse; the store maps both to 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// MAC mismatch or wrong issuer.
    InvalidSignature,
    /// Structurally broken token or missing required fields.
    MalformedPayload,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::MalformedPayload => write!(f, "malformed signature payload"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Signs and verifies capability signatures with one shared HMAC key.
#[derive(Clone)]
pub struct SignatureCodec {
    key: Vec<u8>,
    ttl_secs: i64,
}

impl SignatureCodec {
    pub fn new(secret: &str, ttl_secs: i64) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            ttl_secs,
        }
    }

    /// Produce a signed token for the given binding state. `now` comes from
    /// the caller's clock so expiry is consistent with the enclosing
    /// transaction.
    pub fn sign(
        &self,
        session_id: &str,
        binding_id: &str,
        version: u32,
        role: Role,
        now: DateTime<Utc>,
    ) -> String {
        let payload = SignaturePayload {
            sid: session_id.to_string(),
            bid: binding_id.to_string(),
            ver: version,
            role,
            iss: SIGNATURE_ISSUER.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + self.ttl_secs,
        };

        // Serializing a plain struct of strings and integers cannot fail.
        let body = serde_json::to_vec(&payload).expect("signature payload serializes");
        let encoded = URL_SAFE_NO_PAD.encode(&body);
        let tag = self.mac(encoded.as_bytes());
        format!("{}.{}", encoded, URL_SAFE_NO_PAD.encode(tag))
    }

    /// Verify MAC, issuer, and payload shape. Does not check expiry.
    pub fn verify(&self, token: &str) -> Result<SignaturePayload, SignatureError> {
        let (encoded, tag) = token
            .split_once('.')
            .ok_or(SignatureError::MalformedPayload)?;

        let presented = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| SignatureError::MalformedPayload)?;
        let expected = self.mac(encoded.as_bytes());

        if !bool::from(expected.ct_eq(presented.as_slice())) {
            return Err(SignatureError::InvalidSignature);
        }

        let body = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| SignatureError::MalformedPayload)?;
        let payload: SignaturePayload =
            serde_json::from_slice(&body).map_err(|_| SignatureError::MalformedPayload)?;

        if payload.sid.is_empty() || payload.bid.is_empty() {
            return Err(SignatureError::MalformedPayload);
        }
        if payload.iss != SIGNATURE_ISSUER {
            return Err(SignatureError::InvalidSignature);
        }

        Ok(payload)
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SignatureCodec {
        SignatureCodec::new("test-secret", 300)
    }

    #[test]
    fn sign_then_verify_round_trips_claims() {
        let now = Utc::now();
        let token = codec().sign("sess-1", "bind-1", 3, Role::Student, now);
        let payload = codec().verify(&token).expect("valid token verifies");

        assert_eq!(payload.sid, "sess-1");
        assert_eq!(payload.bid, "bind-1");
        assert_eq!(payload.ver, 3);
        assert_eq!(payload.role, Role::Student);
        assert_eq!(payload.iss, SIGNATURE_ISSUER);
        assert_eq!(payload.exp, now.timestamp() + 300);
    }

    #[test]
    fn tampered_payload_fails() {
        let token = codec().sign("sess-1", "bind-1", 1, Role::Admin, Utc::now());
        let (body, tag) = token.split_once('.').expect("token has two parts");
        let forged_body = URL_SAFE_NO_PAD.encode(
            br#"{"sid":"sess-2","bid":"bind-1","ver":1,"role":"admin","iss":"examgate-session-core","iat":0,"exp":9999999999}"#,
        );
        assert!(body != forged_body);

        let forged = format!("{}.{}", forged_body, tag);
        assert_eq!(
            codec().verify(&forged),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn wrong_key_fails() {
        let token = codec().sign("sess-1", "bind-1", 1, Role::Student, Utc::now());
        let other = SignatureCodec::new("other-secret", 300);
        assert_eq!(other.verify(&token), Err(SignatureError::InvalidSignature));
    }

    #[test]
    fn wrong_issuer_fails() {
        let now = Utc::now();
        let codec = codec();
        let payload = SignaturePayload {
            sid: "sess-1".to_string(),
            bid: "bind-1".to_string(),
            ver: 1,
            role: Role::Student,
            iss: "someone-else".to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + 300,
        };
        let body = serde_json::to_vec(&payload).expect("serializes");
        let encoded = URL_SAFE_NO_PAD.encode(&body);
        let tag = codec.mac(encoded.as_bytes());
        let token = format!("{}.{}", encoded, URL_SAFE_NO_PAD.encode(tag));

        assert_eq!(codec.verify(&token), Err(SignatureError::InvalidSignature));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            codec().verify("not-a-token"),
            Err(SignatureError::MalformedPayload)
        );
        assert_eq!(
            codec().verify("a.b.c"),
            Err(SignatureError::MalformedPayload)
        );
        assert_eq!(codec().verify(""), Err(SignatureError::MalformedPayload));
    }

    #[test]
    fn missing_fields_are_malformed() {
        let codec = codec();
        let body = URL_SAFE_NO_PAD.encode(br#"{"sid":"sess-1"}"#);
        let tag = codec.mac(body.as_bytes());
        let token = format!("{}.{}", body, URL_SAFE_NO_PAD.encode(tag));

        assert_eq!(codec.verify(&token), Err(SignatureError::MalformedPayload));
    }

    #[test]
    fn expiry_is_not_checked_here() {
        // Freshness is the store's job; the codec only vouches for the MAC.
        let past = Utc::now() - chrono::Duration::hours(2);
        let token = codec().sign("sess-1", "bind-1", 1, Role::Student, past);
        let payload = codec().verify(&token).expect("stale token still verifies");
        assert!(payload.exp < Utc::now().timestamp());
    }
}
