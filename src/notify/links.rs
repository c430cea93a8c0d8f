use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("storage key is empty")]
    EmptyKey,
    #[error("signing key rejected")]
    InvalidSigningKey,
    #[error("malformed download link: {0}")]
    Malformed(String),
    #[error("download link expired at {0}")]
    Expired(i64),
    #[error("download link signature mismatch")]
    BadSignature,
}

/// Issues time-limited download URLs for stored files.
pub trait DownloadLinks: Send + Sync {
    fn download_url(&self, storage_key: &str) -> Result<String, LinkError>;
}

/// HMAC-SHA256 signed links of the form
/// `{base}/{key}?expires={unix}&signature={base64url}`.
#[derive(Clone)]
pub struct SignedLinkGenerator {
    base_url: String,
    signing_key: Vec<u8>,
    ttl: Duration,
}

impl SignedLinkGenerator {
    pub fn new(base_url: impl Into<String>, signing_key: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_key: signing_key.as_ref().to_vec(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a link for `storage_key` that expires `ttl` after `now`.
    pub fn sign_at(&self, storage_key: &str, now: DateTime<Utc>) -> Result<String, LinkError> {
        if storage_key.is_empty() {
            return Err(LinkError::EmptyKey);
        }
        let expires = (now + self.ttl).timestamp();
        let signature = URL_SAFE_NO_PAD.encode(self.mac(storage_key, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.base_url, storage_key, expires, signature
        ))
    }

    /// Check a link issued by this generator. Returns its storage key.
    pub fn verify_at(&self, url: &str, now: DateTime<Utc>) -> Result<String, LinkError> {
        let rest = url
            .strip_prefix(&self.base_url)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| LinkError::Malformed("unexpected base url".into()))?;
        let (key, query) = rest
            .split_once('?')
            .ok_or_else(|| LinkError::Malformed("missing query".into()))?;

        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse::<i64>().ok(),
                Some(("signature", v)) => signature = Some(v),
                _ => {}
            }
        }
        let expires = expires.ok_or_else(|| LinkError::Malformed("missing expires".into()))?;
        let signature = signature.ok_or_else(|| LinkError::Malformed("missing signature".into()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| LinkError::Malformed(e.to_string()))?;

        self.mac(key, expires)?
            .verify_slice(&signature)
            .map_err(|_| LinkError::BadSignature)?;

        if now.timestamp() > expires {
            return Err(LinkError::Expired(expires));
        }
        Ok(key.to_string())
    }

    pub fn verify(&self, url: &str) -> Result<String, LinkError> {
        self.verify_at(url, Utc::now())
    }

    fn mac(&self, key: &str, expires: i64) -> Result<HmacSha256, LinkError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.signing_key).map_err(|_| LinkError::InvalidSigningKey)?;
        mac.update(key.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }
}

impl DownloadLinks for SignedLinkGenerator {
    fn download_url(&self, storage_key: &str) -> Result<String, LinkError> {
        self.sign_at(storage_key, Utc::now())
    }
}
