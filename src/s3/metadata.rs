//! Object metadata
//!
//! User metadata is kept under full, lower-cased header names. Names given
//! without an `x-` prefix are namespaced under the vendor metadata prefix,
//! so `color`, `Color` and `x-iijgio-meta-color` address the same entry.

use crate::s3::canonical::{COMPAT_USER_METADATA_PREFIX, USER_METADATA_PREFIX, VENDOR_HEADER_PREFIX};
use crate::s3::error::Result;
use chrono::{DateTime, Utc};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const CONTENT_MD5: &str = "content-md5";

/// Header holding the website redirect target of an object
pub fn website_redirect_header() -> String {
    format!("{}website-redirect-location", VENDOR_HEADER_PREFIX)
}

/// Case-insensitive, prefix-normalizing user metadata store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl UserMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(name: &str) -> String {
        let lower = name.trim().to_ascii_lowercase();
        if lower.starts_with("x-") {
            lower
        } else {
            format!("{}{}", USER_METADATA_PREFIX, lower)
        }
    }

    /// Append a value. Existing values for the name are kept.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(Self::normalize(name))
            .or_default()
            .push(value.into());
    }

    /// Replace all values of a name.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(Self::normalize(name), vec![value.into()]);
    }

    /// First value of a name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&Self::normalize(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.entries.remove(&Self::normalize(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collect vendor and compatibility metadata headers of a response.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut metadata = Self::new();
        for (name, value) in headers {
            let key = name.as_str();
            if key.starts_with(USER_METADATA_PREFIX) || key.starts_with(COMPAT_USER_METADATA_PREFIX) {
                metadata.add(key, String::from_utf8_lossy(value.as_bytes()));
            }
        }
        metadata
    }

    pub fn write_headers(&self, headers: &mut HeaderMap) -> Result<()> {
        for (name, values) in &self.entries {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(hyper::http::Error::from)?;
            for value in values {
                let value = HeaderValue::from_str(value).map_err(hyper::http::Error::from)?;
                headers.append(header.clone(), value);
            }
        }
        Ok(())
    }
}

impl fmt::Display for UserMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}: [{}]", k, v.join(",")))
            .collect();
        f.write_str(&rendered.join(","))
    }
}

/// HTTP and user metadata of an object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub content_md5: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub website_redirect_location: Option<String>,
    user: UserMetadata,
}

impl ObjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_user_metadata(mut self, name: &str, value: impl Into<String>) -> Self {
        self.user.add(name, value);
        self
    }

    pub fn add_user_metadata(&mut self, name: &str, value: impl Into<String>) {
        self.user.add(name, value);
    }

    pub fn get_user_metadata(&self, name: &str) -> Option<&str> {
        self.user.get(name)
    }

    pub fn user_metadata(&self) -> &UserMetadata {
        &self.user
    }

    pub fn user_metadata_mut(&mut self) -> &mut UserMetadata {
        &mut self.user
    }

    /// Write the metadata as request headers. `Content-Length` is left to
    /// the HTTP layer, which derives it from the body.
    pub fn apply_to(&self, headers: &mut HeaderMap) -> Result<()> {
        let redirect = website_redirect_header();
        let fields: [(&str, &Option<String>); 6] = [
            (CONTENT_TYPE.as_str(), &self.content_type),
            (CONTENT_MD5, &self.content_md5),
            (CONTENT_DISPOSITION.as_str(), &self.content_disposition),
            (CONTENT_ENCODING.as_str(), &self.content_encoding),
            (CACHE_CONTROL.as_str(), &self.cache_control),
            (redirect.as_str(), &self.website_redirect_location),
        ];

        for (name, value) in fields {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(hyper::http::Error::from)?;
                let value = HeaderValue::from_str(value).map_err(hyper::http::Error::from)?;
                headers.insert(name, value);
            }
        }
        self.user.write_headers(headers)
    }

    /// Read metadata from response headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        };

        Self {
            content_length: text(CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok()),
            content_type: text(CONTENT_TYPE.as_str()),
            content_md5: text(CONTENT_MD5),
            content_disposition: text(CONTENT_DISPOSITION.as_str()),
            content_encoding: text(CONTENT_ENCODING.as_str()),
            cache_control: text(CACHE_CONTROL.as_str()),
            website_redirect_location: text(&website_redirect_header()),
            user: UserMetadata::from_headers(headers),
        }
    }
}

impl fmt::Display for ObjectMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::new();
        let mut push = |label: &str, value: &Option<String>| {
            if let Some(v) = value {
                fields.push(format!("{}: {}", label, v));
            }
        };
        push("Content-Type", &self.content_type);
        push("Content-MD5", &self.content_md5);
        push("Content-Disposition", &self.content_disposition);
        push("Content-Encoding", &self.content_encoding);
        push("Cache-Control", &self.cache_control);
        push("Website-Redirect-Location", &self.website_redirect_location);
        if let Some(length) = self.content_length {
            fields.push(format!("Content-Length: {}", length));
        }
        if !self.user.is_empty() {
            fields.push(self.user.to_string());
        }
        f.write_str(&fields.join(","))
    }
}

/// Result of a HEAD on an object
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub metadata: ObjectMetadata,
}

impl ObjectInfo {
    pub fn from_headers(bucket: &str, key: &str, headers: &HeaderMap) -> Self {
        let metadata = ObjectMetadata::from_headers(headers);
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));

        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: headers
                .get(ETAG)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .unwrap_or_default(),
            last_modified,
            size: metadata.content_length.unwrap_or(0),
            metadata,
        }
    }
}
