//! HMAC-SHA1 request signer
//!
//! ```text
//! StringToSign = METHOD + "\n" +
//!                Content-MD5 + "\n" +
//!                Content-Type + "\n" +
//!                Date + "\n" +
//!                CanonicalHeaders +
//!                CanonicalResource
//!
//! Authorization: <vendor-token> <access-key-id>:Base64(HMAC-SHA1(secret, StringToSign))
//! ```

use crate::s3::canonical::{canonical_headers, canonical_resource};
use crate::s3::error::{Result, StorageError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, DATE};
use hyper::{Method, Request, Uri};
use sha1::Sha1;
use std::fmt;

type HmacSha1 = Hmac<Sha1>;

/// Default vendor token of the Authorization header
pub const DEFAULT_VENDOR: &str = "IIJGIO";

/// Content type used when a request does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// HTTP date format used for the `Date` header
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a timestamp as an HTTP date (`Mon, 15 Jun 2015 12:18:51 GMT`)
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

/// Access key pair. An empty access key id means anonymous access.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Requests are only signed when an access key id is configured.
    pub fn is_anonymous(&self) -> bool {
        self.access_key_id.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Request signer
#[derive(Clone, Debug)]
pub struct Signer {
    credentials: Credentials,
    vendor: String,
}

impl Signer {
    pub fn new(credentials: Credentials, vendor: impl Into<String>) -> Self {
        Self {
            credentials,
            vendor: vendor.into(),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// Sign a request in place.
    ///
    /// Sets `Date` (only if absent), `Content-Type` (only if absent) and
    /// `Authorization`. Fails without touching the request when either
    /// half of the credentials is empty.
    pub fn sign<B>(&self, request: &mut Request<B>) -> Result<()> {
        if self.credentials.access_key_id.is_empty()
            || self.credentials.secret_access_key.is_empty()
        {
            return Err(StorageError::MissingCredentials);
        }

        let headers = request.headers_mut();
        if !headers.contains_key(DATE) {
            let date = HeaderValue::from_str(&http_date(Utc::now()))
                .map_err(hyper::http::Error::from)?;
            headers.insert(DATE, date);
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        }

        let string_to_sign = Self::string_to_sign(request.method(), request.uri(), request.headers());
        let signature = self.signature(&string_to_sign);

        tracing::trace!(string_to_sign = ?string_to_sign, "Built string to sign");

        let authorization = format!(
            "{} {}:{}",
            self.vendor, self.credentials.access_key_id, signature
        );
        let value = HeaderValue::from_str(&authorization).map_err(hyper::http::Error::from)?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }

    /// Compose the string to sign of a request.
    pub fn string_to_sign(method: &Method, uri: &Uri, headers: &HeaderMap) -> String {
        let header = |name: &str| {
            headers
                .get(name)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .unwrap_or_default()
        };

        let canonical_headers = canonical_headers(headers);
        let canonical_resource = canonical_resource(uri);

        let mut s = String::with_capacity(128 + canonical_headers.len() + canonical_resource.len());
        s.push_str(method.as_str());
        s.push('\n');
        s.push_str(&header("content-md5"));
        s.push('\n');
        s.push_str(&header("content-type"));
        s.push('\n');
        s.push_str(&header("date"));
        s.push('\n');
        s.push_str(&canonical_headers);
        s.push_str(&canonical_resource);
        s
    }

    /// Base64 HMAC-SHA1 of the string to sign keyed with the secret.
    pub fn signature(&self, string_to_sign: &str) -> String {
        let mut mac = HmacSha1::new_from_slice(self.credentials.secret_access_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}
