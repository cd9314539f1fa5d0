//! Wire data model and XML request bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Write as FmtWrite;

/// Numeric fields that some responses send empty (`<MaxKeys/>`).
fn lenient_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.trim().parse().ok()).unwrap_or(0))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Owner or initiator of a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Owner {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "DisplayName")]
    pub display_name: String,
}

// =============================================================================
// Buckets
// =============================================================================

/// Bucket entry of a bucket listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Bucket {
    pub name: String,
    pub creation_date: String,
    /// Region the bucket lives in
    #[serde(rename = "LocationConstraint")]
    pub region: String,
}

#[derive(Debug, Default, Deserialize)]
struct BucketList {
    #[serde(rename = "Bucket", default)]
    items: Vec<Bucket>,
}

fn unwrap_buckets<'de, D>(deserializer: D) -> std::result::Result<Vec<Bucket>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(BucketList::deserialize(deserializer)?.items)
}

/// Response of the service-level bucket listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketListing {
    #[serde(rename = "Owner")]
    pub owner: Owner,
    #[serde(rename = "Buckets", deserialize_with = "unwrap_buckets")]
    pub buckets: Vec<Bucket>,
}

/// Body of a bucket location response: `<LocationConstraint>region</LocationConstraint>`
#[derive(Debug, Default, Deserialize)]
pub(crate) struct LocationConstraint {
    #[serde(rename = "$text", default)]
    pub region: String,
}

// =============================================================================
// Objects
// =============================================================================

/// Object entry of an object listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    pub size: u64,
    pub storage_class: String,
    pub owner: Option<Owner>,
}

impl ObjectSummary {
    pub fn last_modified_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.last_modified)
    }
}

/// Rolled-up key prefix of a delimited listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CommonPrefix {
    pub prefix: String,
}

/// One page of an object listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ObjectListing {
    /// Bucket name
    pub name: String,
    pub prefix: String,
    pub marker: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub max_keys: u32,
    pub delimiter: String,
    pub next_marker: String,
    pub is_truncated: bool,
    #[serde(rename = "Contents")]
    pub contents: Vec<ObjectSummary>,
    #[serde(rename = "CommonPrefixes")]
    pub common_prefixes: Vec<CommonPrefix>,
}

/// Key deleted by a multiple-object delete
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeletedObject {
    pub key: String,
}

/// Key that could not be deleted by a multiple-object delete
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Result of a multiple-object delete
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionResult {
    #[serde(rename = "Deleted")]
    pub deleted: Vec<DeletedObject>,
    #[serde(rename = "Error")]
    pub errors: Vec<DeleteFailure>,
}

// =============================================================================
// Multipart Upload Types
// =============================================================================

/// Server-side multipart upload session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MultipartUpload {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

impl MultipartUpload {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, upload_id: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
        }
    }
}

/// One uploaded part: number (1-based) and ETag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub part_number: u32,
    pub etag: String,
}

impl Part {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

/// Entry of a multipart upload listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UploadSummary {
    pub key: String,
    pub upload_id: String,
    pub initiator: Option<Owner>,
    pub owner: Option<Owner>,
    pub storage_class: String,
    pub initiated: String,
}

/// One page of a multipart upload listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MultipartUploadListing {
    pub bucket: String,
    pub prefix: String,
    pub key_marker: String,
    pub upload_id_marker: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub max_uploads: u32,
    pub delimiter: String,
    pub next_key_marker: String,
    pub next_upload_id_marker: String,
    pub is_truncated: bool,
    #[serde(rename = "Upload")]
    pub uploads: Vec<UploadSummary>,
    #[serde(rename = "CommonPrefixes")]
    pub common_prefixes: Vec<CommonPrefix>,
}

/// Entry of a part listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PartSummary {
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
    pub last_modified: String,
    pub size: u64,
}

/// One page of the parts of an upload session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PartListing {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub part_number_marker: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub max_parts: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub next_part_number_marker: u32,
    pub is_truncated: bool,
    pub initiator: Option<Owner>,
    pub owner: Option<Owner>,
    pub storage_class: String,
    #[serde(rename = "Part")]
    pub parts: Vec<PartSummary>,
}

impl PartListing {
    pub fn get_part(&self, part_number: u32) -> Option<&PartSummary> {
        self.parts.iter().find(|p| p.part_number == part_number)
    }
}

/// Response of a part copy
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct CopyPartResult {
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// Response of a completed multipart upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CompleteMultipartUploadResult {
    pub location: String,
    pub bucket: String,
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

// =============================================================================
// Service usage
// =============================================================================

/// Storage usage of the contract and the account, in bytes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StorageSpace {
    pub contract_used: i64,
    pub account_used: i64,
}

/// Downstream traffic of one charge date (YYYYMMDD)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DownTraffic {
    pub charge_date: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficListing {
    #[serde(rename = "DownTraffics")]
    pub traffics: Vec<DownTraffic>,
}

// =============================================================================
// Request bodies
// =============================================================================

/// Escape XML special characters into an existing buffer
pub(crate) fn xml_escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            _ => buf.push(ch),
        }
    }
}

/// Body of a complete request. Parts are written in the given order.
pub fn complete_multipart_upload_xml(parts: &[Part]) -> String {
    let mut xml = String::with_capacity(parts.len() * 100 + 100);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    xml.push_str("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str("<Part><PartNumber>");
        let _ = write!(xml, "{}", part.part_number);
        xml.push_str("</PartNumber><ETag>");
        xml_escape_into(&mut xml, &part.etag);
        xml.push_str("</ETag></Part>");
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Body of a multiple-object delete request
pub fn delete_objects_xml<S: AsRef<str>>(keys: &[S], quiet: bool) -> String {
    let mut xml = String::with_capacity(keys.len() * 64 + 100);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    xml.push_str("<Delete><Quiet>");
    xml.push_str(if quiet { "true" } else { "false" });
    xml.push_str("</Quiet>");
    for key in keys {
        xml.push_str("<Object><Key>");
        xml_escape_into(&mut xml, key.as_ref());
        xml.push_str("</Key></Object>");
    }
    xml.push_str("</Delete>");
    xml
}
