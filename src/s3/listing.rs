//! Listing requests and the pagination cursor
//!
//! A page never fetches its successor. Callers ask a truncated page for
//! the request of the next page and issue it themselves.

use crate::s3::error::{Result, StorageError};
use crate::s3::types::{MultipartUploadListing, ObjectListing, PartListing};
use std::collections::BTreeMap;

/// Page size used when a request does not set one
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Cursor contract shared by all paginated collections.
pub trait Paginated {
    type Request;

    fn is_truncated(&self) -> bool;

    /// Parameters of the next page: the filters of this page with its
    /// continuation markers. Fails with [`StorageError::NotTruncated`] on
    /// the last page.
    fn next_page_request(&self) -> Result<Self::Request>;
}

fn insert_non_empty(query: &mut BTreeMap<String, String>, name: &str, value: &str) {
    if !value.is_empty() {
        query.insert(name.to_string(), value.to_string());
    }
}

fn insert_non_zero(query: &mut BTreeMap<String, String>, name: &str, value: u32) {
    if value > 0 {
        query.insert(name.to_string(), value.to_string());
    }
}

/// Parameters of an object listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObjectsRequest {
    pub bucket: String,
    pub prefix: String,
    pub marker: String,
    pub delimiter: String,
    pub max_keys: u32,
}

impl ListObjectsRequest {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            marker: String::new(),
            delimiter: String::new(),
            max_keys: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_max_keys(mut self, max_keys: u32) -> Self {
        self.max_keys = max_keys;
        self
    }

    pub(crate) fn query(&self) -> BTreeMap<String, String> {
        let mut query = BTreeMap::new();
        insert_non_empty(&mut query, "prefix", &self.prefix);
        insert_non_empty(&mut query, "marker", &self.marker);
        insert_non_empty(&mut query, "delimiter", &self.delimiter);
        insert_non_zero(&mut query, "max-keys", self.max_keys);
        query
    }
}

impl Paginated for ObjectListing {
    type Request = ListObjectsRequest;

    fn is_truncated(&self) -> bool {
        self.is_truncated
    }

    fn next_page_request(&self) -> Result<ListObjectsRequest> {
        if !self.is_truncated {
            return Err(StorageError::NotTruncated);
        }

        // NextMarker is only returned for delimited listings; otherwise the
        // last key of the page continues the listing.
        let marker = if !self.next_marker.is_empty() {
            self.next_marker.clone()
        } else {
            let last_key = self.contents.last().map(|o| o.key.as_str());
            let last_prefix = self.common_prefixes.last().map(|p| p.prefix.as_str());
            last_key.max(last_prefix).unwrap_or_default().to_string()
        };
        if marker.is_empty() || marker == self.marker {
            return Err(StorageError::StalledListing(marker));
        }

        Ok(ListObjectsRequest {
            bucket: self.name.clone(),
            prefix: self.prefix.clone(),
            marker,
            delimiter: self.delimiter.clone(),
            max_keys: self.max_keys,
        })
    }
}

/// Parameters of a multipart upload listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListUploadsRequest {
    pub bucket: String,
    pub prefix: String,
    pub key_marker: String,
    pub upload_id_marker: String,
    pub delimiter: String,
    pub max_uploads: u32,
}

impl ListUploadsRequest {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            key_marker: String::new(),
            upload_id_marker: String::new(),
            delimiter: String::new(),
            max_uploads: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_markers(mut self, key_marker: impl Into<String>, upload_id_marker: impl Into<String>) -> Self {
        self.key_marker = key_marker.into();
        self.upload_id_marker = upload_id_marker.into();
        self
    }

    pub fn with_max_uploads(mut self, max_uploads: u32) -> Self {
        self.max_uploads = max_uploads;
        self
    }

    pub(crate) fn query(&self) -> BTreeMap<String, String> {
        let mut query = BTreeMap::new();
        query.insert("uploads".to_string(), String::new());
        insert_non_empty(&mut query, "prefix", &self.prefix);
        insert_non_empty(&mut query, "key-marker", &self.key_marker);
        insert_non_empty(&mut query, "upload-id-marker", &self.upload_id_marker);
        insert_non_empty(&mut query, "delimiter", &self.delimiter);
        insert_non_zero(&mut query, "max-uploads", self.max_uploads);
        query
    }
}

impl Paginated for MultipartUploadListing {
    type Request = ListUploadsRequest;

    fn is_truncated(&self) -> bool {
        self.is_truncated
    }

    fn next_page_request(&self) -> Result<ListUploadsRequest> {
        if !self.is_truncated {
            return Err(StorageError::NotTruncated);
        }

        // Without NextKeyMarker the last entry of the page continues the listing.
        let (key_marker, upload_id_marker) = if !self.next_key_marker.is_empty() {
            (self.next_key_marker.clone(), self.next_upload_id_marker.clone())
        } else {
            let last_upload = self.uploads.last().map(|u| (u.key.as_str(), u.upload_id.as_str()));
            let last_prefix = self.common_prefixes.last().map(|p| (p.prefix.as_str(), ""));
            let (key, upload_id) = last_upload.max(last_prefix).unwrap_or_default();
            (key.to_string(), upload_id.to_string())
        };
        if key_marker.is_empty()
            || (key_marker == self.key_marker && upload_id_marker == self.upload_id_marker)
        {
            return Err(StorageError::StalledListing(format!("{}/{}", key_marker, upload_id_marker)));
        }

        Ok(ListUploadsRequest {
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            key_marker,
            upload_id_marker,
            delimiter: self.delimiter.clone(),
            max_uploads: self.max_uploads,
        })
    }
}

/// Parameters of a part listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPartsRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number_marker: u32,
    pub max_parts: u32,
}

impl ListPartsRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, upload_id: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
            part_number_marker: 0,
            max_parts: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_part_number_marker(mut self, marker: u32) -> Self {
        self.part_number_marker = marker;
        self
    }

    pub fn with_max_parts(mut self, max_parts: u32) -> Self {
        self.max_parts = max_parts;
        self
    }

    pub(crate) fn query(&self) -> BTreeMap<String, String> {
        let mut query = BTreeMap::new();
        query.insert("uploadId".to_string(), self.upload_id.clone());
        insert_non_zero(&mut query, "part-number-marker", self.part_number_marker);
        insert_non_zero(&mut query, "max-parts", self.max_parts);
        query
    }
}

impl Paginated for PartListing {
    type Request = ListPartsRequest;

    fn is_truncated(&self) -> bool {
        self.is_truncated
    }

    fn next_page_request(&self) -> Result<ListPartsRequest> {
        if !self.is_truncated {
            return Err(StorageError::NotTruncated);
        }

        let marker = if self.next_part_number_marker > 0 {
            self.next_part_number_marker
        } else {
            self.parts.iter().map(|p| p.part_number).max().unwrap_or(0)
        };
        if marker <= self.part_number_marker {
            return Err(StorageError::StalledListing(marker.to_string()));
        }

        Ok(ListPartsRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.upload_id.clone(),
            part_number_marker: marker,
            max_parts: self.max_parts,
        })
    }
}
