//! HMAC-signed, expiring callback URLs
//!
//! `sign` appends `expiry=<unix seconds>` and `signature=<hex hmac>` to a base
//! URL. The MAC covers the canonical form of the URL: scheme, host, port and
//! path as parsed, plus every query pair except `signature`, decoded, sorted by
//! key then value and re-encoded with `application/x-www-form-urlencoded`
//! rules. Both sides run the same canonicalization, so equivalent encodings
//! (`+` vs `%20`, parameter order) verify identically.

use std::sync::Arc;

use aws_lc_rs::hmac;
use chrono::{DateTime, Utc};
use kube_jit_common::clock::SharedClock;
use url::Url;

use crate::{hex_decode, hex_encode};

/// Query parameter carrying the expiry instant
pub const EXPIRY_PARAM: &str = "expiry";

/// Query parameter carrying the MAC
pub const SIGNATURE_PARAM: &str = "signature";

/// Why a URL was not accepted
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignedUrlError {
    /// Not an absolute URL
    #[error("malformed url: {0}")]
    Malformed(String),
    /// The base URL already carries a reserved parameter
    #[error("base url must not contain '{0}'")]
    Reserved(&'static str),
    /// A required parameter is absent
    #[error("missing '{0}' parameter")]
    Missing(&'static str),
    /// A reserved parameter appears more than once
    #[error("duplicate '{0}' parameter")]
    Duplicate(&'static str),
    /// `expiry` is not an integer
    #[error("expiry is not a unix timestamp")]
    BadExpiry,
    /// MAC mismatch
    #[error("signature mismatch")]
    BadSignature,
    /// `expiry <= now`
    #[error("url expired")]
    Expired,
}

/// A URL that passed verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUrl {
    /// Expiry instant carried by the URL
    pub expiry: DateTime<Utc>,
    /// Decoded query pairs other than `signature`, in canonical order
    pub params: Vec<(String, String)>,
}

impl VerifiedUrl {
    /// First value of a signed query parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Signs and verifies callback URLs with a process-wide key
pub struct UrlSigner {
    key: hmac::Key,
    clock: SharedClock,
}

impl UrlSigner {
    /// Create a signer. An empty secret is refused.
    pub fn new(secret: &[u8], clock: SharedClock) -> Result<Self, SignedUrlError> {
        if secret.is_empty() {
            return Err(SignedUrlError::Malformed("empty signing key".into()));
        }
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            clock,
        })
    }

    /// Sign `base` so it verifies until `expiry`.
    pub fn sign(&self, base: &str, expiry: DateTime<Utc>) -> Result<String, SignedUrlError> {
        let url = Url::parse(base).map_err(|e| SignedUrlError::Malformed(e.to_string()))?;
        let mut pairs = decoded_pairs(&url);
        if pairs.iter().any(|(k, _)| k == EXPIRY_PARAM) {
            return Err(SignedUrlError::Reserved(EXPIRY_PARAM));
        }
        if pairs.iter().any(|(k, _)| k == SIGNATURE_PARAM) {
            return Err(SignedUrlError::Reserved(SIGNATURE_PARAM));
        }
        pairs.push((EXPIRY_PARAM.to_string(), expiry.timestamp().to_string()));

        let canonical = canonical_form(&url, &mut pairs);
        let tag = hmac::sign(&self.key, canonical.as_bytes());
        Ok(format!(
            "{}&{}={}",
            canonical,
            SIGNATURE_PARAM,
            hex_encode(tag.as_ref())
        ))
    }

    /// Verify a signed URL against the key and the current time.
    pub fn verify(&self, raw: &str) -> Result<VerifiedUrl, SignedUrlError> {
        let url = Url::parse(raw).map_err(|e| SignedUrlError::Malformed(e.to_string()))?;
        let all = decoded_pairs(&url);

        let signature = single(&all, SIGNATURE_PARAM)?;
        let expiry = single(&all, EXPIRY_PARAM)?;
        let expiry: i64 = expiry.parse().map_err(|_| SignedUrlError::BadExpiry)?;
        let expiry = DateTime::<Utc>::from_timestamp(expiry, 0).ok_or(SignedUrlError::BadExpiry)?;
        let signature = hex_decode(&signature).ok_or(SignedUrlError::BadSignature)?;

        let mut params: Vec<(String, String)> = all
            .into_iter()
            .filter(|(k, _)| k != SIGNATURE_PARAM)
            .collect();
        let canonical = canonical_form(&url, &mut params);

        hmac::verify(&self.key, canonical.as_bytes(), &signature)
            .map_err(|_| SignedUrlError::BadSignature)?;

        if expiry <= self.clock.now() {
            return Err(SignedUrlError::Expired);
        }

        Ok(VerifiedUrl { expiry, params })
    }

    /// Boolean form of [`UrlSigner::verify`]
    pub fn is_valid(&self, raw: &str) -> bool {
        self.verify(raw).is_ok()
    }
}

/// Shared signer handle
pub type SharedSigner = Arc<UrlSigner>;

fn decoded_pairs(url: &Url) -> Vec<(String, String)> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn single(pairs: &[(String, String)], key: &'static str) -> Result<String, SignedUrlError> {
    let mut values = pairs.iter().filter(|(k, _)| k == key).map(|(_, v)| v);
    let first = values.next().ok_or(SignedUrlError::Missing(key))?;
    if values.next().is_some() {
        return Err(SignedUrlError::Duplicate(key));
    }
    Ok(first.clone())
}

fn canonical_form(url: &Url, pairs: &mut [(String, String)]) -> String {
    pairs.sort();
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter())
        .finish();

    let mut out = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(url.path());
    if !query.is_empty() {
        out.push('?');
        out.push_str(&query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use kube_jit_common::clock::{Clock, ManualClock};

    const BASE: &str = "https://jit.example.com/kube-jit-api/k8s-callback?ticketID=1";

    fn signer() -> (UrlSigner, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let signer = UrlSigner::new(b"test-secret", Arc::new(clock.clone())).unwrap();
        (signer, clock)
    }

    #[test]
    fn signed_url_verifies_until_expiry() {
        let (signer, clock) = signer();
        let expiry = clock.now() + Duration::minutes(1);
        let url = signer.sign(BASE, expiry).unwrap();

        let verified = signer.verify(&url).unwrap();
        assert_eq!(verified.expiry, expiry);
        assert_eq!(verified.param("ticketID"), Some("1"));

        clock.advance(Duration::minutes(2));
        assert_eq!(signer.verify(&url), Err(SignedUrlError::Expired));
    }

    #[test]
    fn expiry_equal_to_now_is_rejected() {
        let (signer, clock) = signer();
        let url = signer.sign(BASE, clock.now()).unwrap();
        assert_eq!(signer.verify(&url), Err(SignedUrlError::Expired));
    }

    #[test]
    fn tampering_is_detected() {
        let (signer, clock) = signer();
        let url = signer.sign(BASE, clock.now() + Duration::hours(1)).unwrap();

        let other_ticket = url.replace("ticketID=1", "ticketID=2");
        assert_eq!(
            signer.verify(&other_ticket),
            Err(SignedUrlError::BadSignature)
        );

        let later = url.replace(
            &format!("expiry={}", (clock.now() + Duration::hours(1)).timestamp()),
            &format!("expiry={}", (clock.now() + Duration::hours(9)).timestamp()),
        );
        assert_eq!(signer.verify(&later), Err(SignedUrlError::BadSignature));

        let other_host = url.replace("jit.example.com", "evil.example.com");
        assert_eq!(signer.verify(&other_host), Err(SignedUrlError::BadSignature));
    }

    #[test]
    fn different_key_rejects() {
        let (signer, clock) = signer();
        let url = signer.sign(BASE, clock.now() + Duration::hours(1)).unwrap();
        let other = UrlSigner::new(b"other-secret", Arc::new(clock)).unwrap();
        assert_eq!(other.verify(&url), Err(SignedUrlError::BadSignature));
    }

    #[test]
    fn equivalent_encodings_verify() {
        let (signer, clock) = signer();
        let base = "https://jit.example.com/cb?note=a+b&z=1&a=2";
        let url = signer.sign(base, clock.now() + Duration::hours(1)).unwrap();

        // Reorder parameters and switch '+' to '%20'.
        let parsed = Url::parse(&url).unwrap();
        let signature = parsed
            .query_pairs()
            .find(|(k, _)| k == "signature")
            .unwrap()
            .1
            .into_owned();
        let expiry = parsed
            .query_pairs()
            .find(|(k, _)| k == "expiry")
            .unwrap()
            .1
            .into_owned();
        let reordered = format!(
            "https://jit.example.com/cb?signature={}&a=2&z=1&note=a%20b&expiry={}",
            signature, expiry
        );
        assert!(signer.is_valid(&reordered));
    }

    #[test]
    fn plus_and_literal_plus_differ() {
        let (signer, clock) = signer();
        let url = signer
            .sign(
                "https://jit.example.com/cb?note=a+b",
                clock.now() + Duration::hours(1),
            )
            .unwrap();
        // %2B decodes to a literal '+', not a space.
        let forged = url.replace("note=a+b", "note=a%2Bb");
        assert_eq!(signer.verify(&forged), Err(SignedUrlError::BadSignature));
    }

    #[test]
    fn missing_or_duplicate_parameters_are_rejected() {
        let (signer, clock) = signer();
        let url = signer.sign(BASE, clock.now() + Duration::hours(1)).unwrap();

        let no_sig = url.split("&signature=").next().unwrap().to_string();
        assert_eq!(
            signer.verify(&no_sig),
            Err(SignedUrlError::Missing(SIGNATURE_PARAM))
        );

        assert_eq!(
            signer.verify(&format!("{}&expiry=1", url)),
            Err(SignedUrlError::Duplicate(EXPIRY_PARAM))
        );
        assert_eq!(
            signer.verify(&format!("{}&signature=00", url)),
            Err(SignedUrlError::Duplicate(SIGNATURE_PARAM))
        );
        assert_eq!(
            signer.verify("https://jit.example.com/cb?signature=00"),
            Err(SignedUrlError::Missing(EXPIRY_PARAM))
        );
        assert_eq!(
            signer.verify("https://jit.example.com/cb?expiry=soon&signature=00"),
            Err(SignedUrlError::BadExpiry)
        );
    }

    #[test]
    fn duplicate_ordinary_keys_are_covered_by_the_mac() {
        let (signer, clock) = signer();
        let url = signer
            .sign(
                "https://jit.example.com/cb?k=2&k=1",
                clock.now() + Duration::hours(1),
            )
            .unwrap();
        assert!(signer.is_valid(&url));
        let dropped = url.replace("k=1&", "");
        assert_eq!(signer.verify(&dropped), Err(SignedUrlError::BadSignature));
    }

    #[test]
    fn base_url_must_not_carry_reserved_params() {
        let (signer, clock) = signer();
        assert_eq!(
            signer.sign("https://a/cb?expiry=1", clock.now()),
            Err(SignedUrlError::Reserved(EXPIRY_PARAM))
        );
        assert!(UrlSigner::new(b"", Arc::new(clock)).is_err());
    }
}
