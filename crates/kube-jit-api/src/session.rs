//! Session cookies
//!
//! The session is JSON, base64url-encoded and followed by `.` and a hex
//! HMAC-SHA256 of the encoded payload. The resulting token is split into
//! chunks of at most [`MAX_CHUNK_LEN`] bytes stored in cookies
//! `kube_jit_session_0`, `kube_jit_session_1`, ...

use std::collections::HashMap;

use aws_lc_rs::hmac;
use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::SameSite;
use crate::model::Actor;
use crate::permissions::Permissions;
use crate::{hex_decode, hex_encode};

/// Cookie name prefix; the chunk index is appended
pub const SESSION_COOKIE_PREFIX: &str = "kube_jit_session_";

/// Maximum cookie value length
pub const MAX_CHUNK_LEN: usize = 4000;

/// Session codec failures
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// Key is empty
    #[error("session key must not be empty")]
    EmptyKey,
    /// Token structure is wrong
    #[error("malformed session")]
    Malformed,
    /// MAC mismatch
    #[error("session signature mismatch")]
    BadSignature,
    /// Payload did not (de)serialize
    #[error("session payload: {0}")]
    Payload(String),
}

/// Logged-in user state carried in cookies
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Directory user id
    pub id: String,
    /// Display name
    pub name: String,
    /// E-mail
    pub email: String,
    /// Avatar URL
    #[serde(default)]
    pub avatar_url: String,
    /// Identity provider name
    pub provider: String,
    /// Upstream access token
    pub token: String,
    /// Session end
    pub expires_at: DateTime<Utc>,
    /// Memoized permission resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

impl Session {
    /// The session's principal
    pub fn actor(&self) -> Actor {
        Actor {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// Encodes and verifies chunked session cookies
pub struct SessionCodec {
    key: hmac::Key,
    chunk_len: usize,
    same_site: SameSite,
    max_age_secs: i64,
}

impl SessionCodec {
    /// Create a codec
    pub fn new(secret: &[u8], same_site: SameSite, max_age_secs: i64) -> Result<Self, SessionError> {
        if secret.is_empty() {
            return Err(SessionError::EmptyKey);
        }
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            chunk_len: MAX_CHUNK_LEN,
            same_site,
            max_age_secs,
        })
    }

    /// Override the chunk length (clamped to 1..=MAX_CHUNK_LEN)
    pub fn with_chunk_len(mut self, len: usize) -> Self {
        self.chunk_len = len.clamp(1, MAX_CHUNK_LEN);
        self
    }

    /// Encode `value` into cookie-sized chunks
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<String>, SessionError> {
        let json = serde_json::to_vec(value).map_err(|e| SessionError::Payload(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let tag = hmac::sign(&self.key, payload.as_bytes());
        let token = format!("{}.{}", payload, hex_encode(tag.as_ref()));

        // The token is ASCII, so byte chunks are valid strings.
        Ok(token
            .as_bytes()
            .chunks(self.chunk_len)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect())
    }

    /// Reassemble and verify chunks
    pub fn decode<T: DeserializeOwned>(&self, chunks: &[String]) -> Result<T, SessionError> {
        let token = chunks.concat();
        let (payload, mac) = token.rsplit_once('.').ok_or(SessionError::Malformed)?;
        let mac = hex_decode(mac).ok_or(SessionError::Malformed)?;
        hmac::verify(&self.key, payload.as_bytes(), &mac).map_err(|_| SessionError::BadSignature)?;
        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SessionError::Malformed)?;
        serde_json::from_slice(&json).map_err(|e| SessionError::Payload(e.to_string()))
    }

    fn cookie(&self, index: usize, value: &str, max_age: i64) -> String {
        format!(
            "{}{}={}; Path=/; HttpOnly; Secure; SameSite={}; Max-Age={}",
            SESSION_COOKIE_PREFIX, index, value, self.same_site, max_age
        )
    }

    /// `Set-Cookie` values storing `value`, expiring chunks beyond the new
    /// count that the client still holds (`previous` chunks).
    pub fn set_cookies<T: Serialize>(
        &self,
        value: &T,
        previous: usize,
    ) -> Result<Vec<String>, SessionError> {
        let chunks = self.encode(value)?;
        let mut cookies: Vec<String> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| self.cookie(i, c, self.max_age_secs))
            .collect();
        cookies.extend((chunks.len()..previous).map(|i| self.cookie(i, "", 0)));
        Ok(cookies)
    }

    /// `Set-Cookie` values expiring `count` chunks
    pub fn clear_cookies(&self, count: usize) -> Vec<String> {
        (0..count.max(1)).map(|i| self.cookie(i, "", 0)).collect()
    }

    /// Read and verify the session from request headers.
    ///
    /// Returns `Ok(None)` when no session cookie is present.
    pub fn read<T: DeserializeOwned>(&self, headers: &HeaderMap) -> Result<Option<T>, SessionError> {
        let chunks = session_chunks(headers);
        if chunks.is_empty() {
            return Ok(None);
        }
        self.decode(&chunks).map(Some)
    }
}

fn request_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Session chunks present in the request, in index order
pub fn session_chunks(headers: &HeaderMap) -> Vec<String> {
    let mut cookies = request_cookies(headers);
    let mut chunks = Vec::new();
    while let Some(chunk) = cookies.remove(&format!("{}{}", SESSION_COOKIE_PREFIX, chunks.len())) {
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::TimeZone;

    use crate::permissions::Team;

    fn codec() -> SessionCodec {
        SessionCodec::new(b"cookie-secret", SameSite::Lax, 3600).unwrap()
    }

    fn session() -> Session {
        Session {
            id: "u1".into(),
            name: "User One".into(),
            email: "u1@example.com".into(),
            avatar_url: String::new(),
            provider: "oidc".into(),
            token: "at".into(),
            expires_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            permissions: Some(Permissions {
                approver_groups: vec![Team::new("ga", "group-a")],
                ..Default::default()
            }),
        }
    }

    fn headers_from(set_cookies: &[String]) -> HeaderMap {
        let cookie = set_cookies
            .iter()
            .map(|c| c.split(';').next().unwrap().to_string())
            .collect::<Vec<_>>()
            .join("; ");
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());
        headers
    }

    #[test]
    fn session_survives_multi_chunk_encoding() {
        for len in [1, 7, 64, MAX_CHUNK_LEN] {
            let codec = codec().with_chunk_len(len);
            let chunks = codec.encode(&session()).unwrap();
            assert!(chunks.iter().all(|c| c.len() <= len));
            if len == 7 {
                assert!(chunks.len() >= 2);
            }
            let back: Session = codec.decode(&chunks).unwrap();
            assert_eq!(back, session());
        }
    }

    #[test]
    fn arbitrary_json_shapes_round_trip() {
        let codec = codec().with_chunk_len(16);
        let value = serde_json::json!({"nested": {"list": [1, "two", null]}, "big": "x".repeat(5000)});
        let back: serde_json::Value = codec.decode(&codec.encode(&value).unwrap()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn tampered_chunks_are_rejected() {
        let codec = codec().with_chunk_len(32);
        let mut chunks = codec.encode(&session()).unwrap();
        chunks[0] = chunks[0].replacen('e', "f", 1);
        assert!(codec.decode::<Session>(&chunks).is_err());

        let other = SessionCodec::new(b"other", SameSite::Lax, 3600).unwrap();
        let chunks = codec.encode(&session()).unwrap();
        assert_eq!(
            other.decode::<Session>(&chunks),
            Err(SessionError::BadSignature)
        );
    }

    #[test]
    fn cookies_round_trip_through_headers() {
        let codec = codec().with_chunk_len(50);
        let set = codec.set_cookies(&session(), 0).unwrap();
        assert!(set.len() > 1);
        assert!(set[0].starts_with("kube_jit_session_0="));
        assert!(set[0].contains("HttpOnly; Secure; SameSite=Lax; Max-Age=3600"));

        let read: Session = codec.read(&headers_from(&set)).unwrap().unwrap();
        assert_eq!(read, session());
    }

    #[test]
    fn shrinking_session_expires_stale_chunks() {
        let codec = codec().with_chunk_len(MAX_CHUNK_LEN);
        let set = codec.set_cookies(&session(), 3).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set[1].starts_with("kube_jit_session_1=;"));
        assert!(set[2].ends_with("Max-Age=0"));
    }

    #[test]
    fn missing_cookie_is_none() {
        let headers = HeaderMap::new();
        assert_eq!(codec().read::<Session>(&headers).unwrap(), None);
    }

    #[test]
    fn clear_expires_every_chunk() {
        let cleared = codec().clear_cookies(2);
        assert_eq!(cleared.len(), 2);
        assert!(cleared.iter().all(|c| c.contains("Max-Age=0")));
    }

    #[test]
    fn empty_key_is_refused() {
        assert!(matches!(
            SessionCodec::new(b"", SameSite::Strict, 1),
            Err(SessionError::EmptyKey)
        ));
    }
}
