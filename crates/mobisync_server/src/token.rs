//! Sync token issuing and verification.
//!
//! A sync token is the device's pull cursor for one data type. Clients treat
//! it as opaque and echo back the last one received.
//!
//! ## Token Format
//!
//! ```text
//! base64url(claims) "." base64url(HMAC-SHA256(secret, claims))
//! ```
//!
//! where `claims` is the CBOR encoding of
//! `{v: format version, dev: device id, typ: data type, wm: watermark?}` and
//! the watermark is `(updated_at in Unix micros, entity id)`.
//!
//! Tokens do not expire. A device may resume from an arbitrarily old token;
//! the pull handler bounds the work per call instead.

use crate::error::{SyncError, SyncResult};
use crate::store::Watermark;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::DateTime;
use hmac::{Hmac, Mac};
use mobisync_protocol::{EntityId, EntityType};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Current token format version.
const TOKEN_FORMAT: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    v: u8,
    dev: String,
    typ: EntityType,
    wm: Option<(i64, u64)>,
}

/// The verified content of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// Device the token was issued to.
    pub device_id: String,
    /// Data type the token covers.
    pub data_type: EntityType,
    /// Position of the cursor; `None` means the beginning of time.
    pub watermark: Option<Watermark>,
}

/// Issues and verifies sync tokens with a server secret.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    /// Creates a codec with the given signing secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issues a token for `device_id` and `data_type` positioned at `watermark`.
    pub fn issue(
        &self,
        device_id: &str,
        data_type: EntityType,
        watermark: Option<&Watermark>,
    ) -> SyncResult<String> {
        let claims = TokenClaims {
            v: TOKEN_FORMAT,
            dev: device_id.to_string(),
            typ: data_type,
            wm: watermark.map(|w| (w.updated_at.timestamp_micros(), w.entity_id.as_u64())),
        };

        let mut payload = Vec::new();
        ciborium::into_writer(&claims, &mut payload)
            .map_err(|e| SyncError::Internal(format!("token encode: {e}")))?;
        let signature = self.mac()?.chain_update(&payload).finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Verifies a token and checks it belongs to `device_id` and `data_type`.
    ///
    /// Returns the watermark to resume from.
    pub fn decode(
        &self,
        token: &str,
        device_id: &str,
        data_type: EntityType,
    ) -> SyncResult<Option<Watermark>> {
        let info = self.inspect(token)?;

        if info.device_id != device_id {
            return Err(SyncError::InvalidToken("token was issued to another device".into()));
        }
        if info.data_type != data_type {
            return Err(SyncError::InvalidToken(format!(
                "token was issued for {}, not {}",
                info.data_type, data_type
            )));
        }

        Ok(info.watermark)
    }

    /// Verifies a token's signature and returns its content without checking
    /// device or data type.
    pub fn inspect(&self, token: &str) -> SyncResult<TokenInfo> {
        let (payload_b64, signature_b64) = token
            .split_once('.')
            .ok_or_else(|| SyncError::InvalidToken("malformed token".into()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| SyncError::InvalidToken("malformed token".into()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| SyncError::InvalidToken("malformed token".into()))?;

        // Constant-time comparison.
        self.mac()?
            .chain_update(&payload)
            .verify_slice(&signature)
            .map_err(|_| SyncError::InvalidToken("invalid signature".into()))?;

        let claims: TokenClaims = ciborium::from_reader(payload.as_slice())
            .map_err(|_| SyncError::InvalidToken("malformed claims".into()))?;
        if claims.v != TOKEN_FORMAT {
            return Err(SyncError::InvalidToken(format!(
                "unsupported token format {}",
                claims.v
            )));
        }

        let watermark = match claims.wm {
            None => None,
            Some((micros, id)) => {
                let updated_at = DateTime::from_timestamp_micros(micros)
                    .ok_or_else(|| SyncError::InvalidToken("watermark out of range".into()))?;
                Some(Watermark::new(updated_at, EntityId(id)))
            }
        };

        Ok(TokenInfo {
            device_id: claims.dev,
            data_type: claims.typ,
            watermark,
        })
    }

    fn mac(&self) -> SyncResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SyncError::Internal(format!("token key: {e}")))
    }
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn codec() -> TokenCodec {
        TokenCodec::new(b"test-secret-key-32-bytes-long!!".to_vec())
    }

    fn watermark() -> Watermark {
        let at = DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();
        Watermark::new(at, EntityId(17))
    }

    #[test]
    fn issue_and_decode() {
        let codec = codec();
        let mark = watermark();
        let token = codec
            .issue("device-1", EntityType::Payment, Some(&mark))
            .unwrap();

        let decoded = codec
            .decode(&token, "device-1", EntityType::Payment)
            .unwrap();
        assert_eq!(decoded, Some(mark));
    }

    #[test]
    fn beginning_of_time_token() {
        let codec = codec();
        let token = codec.issue("device-1", EntityType::Bonus, None).unwrap();
        assert_eq!(codec.decode(&token, "device-1", EntityType::Bonus).unwrap(), None);
    }

    #[test]
    fn reject_wrong_device() {
        let codec = codec();
        let token = codec.issue("device-1", EntityType::Payment, None).unwrap();
        let result = codec.decode(&token, "device-2", EntityType::Payment);
        assert!(matches!(result, Err(SyncError::InvalidToken(_))));
    }

    #[test]
    fn reject_wrong_data_type() {
        let codec = codec();
        let token = codec.issue("device-1", EntityType::Payment, None).unwrap();
        let result = codec.decode(&token, "device-1", EntityType::Inventory);
        assert!(matches!(result, Err(SyncError::InvalidToken(_))));
    }

    #[test]
    fn reject_tampered_token() {
        let codec = codec();
        let token = codec
            .issue("device-1", EntityType::Payment, Some(&watermark()))
            .unwrap();

        let (payload, signature) = token.split_once('.').unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(payload).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(bytes), signature);

        assert!(codec.decode(&forged, "device-1", EntityType::Payment).is_err());
    }

    #[test]
    fn reject_other_secret() {
        let token = codec().issue("device-1", EntityType::Payment, None).unwrap();
        let other = TokenCodec::new(b"another-secret-entirely-32bytes".to_vec());
        assert!(other.decode(&token, "device-1", EntityType::Payment).is_err());
    }

    #[test]
    fn reject_garbage() {
        let codec = codec();
        for garbage in ["", "abc", "a.b", "!!!.???", "e30.e30"] {
            assert!(
                codec.inspect(garbage).is_err(),
                "accepted garbage token {garbage:?}"
            );
        }
    }
}
