//! Object storage protocol client
//!
//! This module provides:
//! - HMAC-SHA1 request signing over a canonical request form
//! - A retrying request executor over a pluggable HTTP transport
//! - The bucket, object and multipart operation surface
//! - Multipart transfer orchestration for files, streams and server-side copies

pub mod canonical;
pub mod client;
pub mod error;
pub mod executor;
pub mod listing;
pub mod metadata;
pub mod multipart;
pub mod region;
pub mod signer;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::{content_type_for, ClientOptions, StorageClient};
pub use error::{Result, ServiceError, StorageError};
pub use executor::{RequestExecutor, RetryPolicy};
pub use listing::{ListObjectsRequest, ListPartsRequest, ListUploadsRequest, Paginated};
pub use metadata::{ObjectInfo, ObjectMetadata, UserMetadata};
pub use multipart::{TransferSettings, TransferState, UploadOutcome};
pub use region::{Endpoint, EndpointGuard, Region, RegionDirectory};
pub use signer::{Credentials, Signer};
pub use transport::{BodyDigest, FileSection, HttpTransport, HyperTransport, RequestBody, ResponseBody, TransportOptions};
pub use types::{
    Bucket, BucketListing, CommonPrefix, CompleteMultipartUploadResult, DeletionResult, DownTraffic,
    MultipartUpload, MultipartUploadListing, ObjectListing, ObjectSummary, Owner, Part, PartListing,
    PartSummary, StorageSpace, TrafficListing, UploadSummary,
};
