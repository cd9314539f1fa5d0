//! Storage API client
//!
//! One method per REST operation. Bucket scoped calls resolve the bucket's
//! regional endpoint first (cached per client) and build their URL against
//! it; service calls use the default endpoint unless a region is named.

use crate::s3::canonical::{encode_component, VENDOR_HEADER_PREFIX};
use crate::s3::error::{Result, StorageError};
use crate::s3::executor::{decode_xml, RequestExecutor, RetryPolicy};
use crate::s3::listing::{ListObjectsRequest, ListPartsRequest, ListUploadsRequest, Paginated};
use crate::s3::metadata::{ObjectInfo, ObjectMetadata};
use crate::s3::multipart::TransferSettings;
use crate::s3::region::{Endpoint, EndpointGuard, EndpointSlot, RegionDirectory, RegionResolver};
use crate::s3::signer::{Credentials, Signer, DEFAULT_CONTENT_TYPE, DEFAULT_VENDOR};
use crate::s3::transport::{BodyDigest, FileSection, HttpTransport, HyperTransport, RequestBody, TransportOptions};
use crate::s3::types::{
    complete_multipart_upload_xml, delete_objects_xml, BucketListing, CompleteMultipartUploadResult,
    CopyPartResult, DeletionResult, DownTraffic, LocationConstraint, MultipartUpload,
    MultipartUploadListing, ObjectListing, ObjectSummary, Part, PartListing, StorageSpace,
    TrafficListing,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use hyper::{Method, Request, Response};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

type Query = BTreeMap<String, String>;

fn query(pairs: &[(&str, &str)]) -> Query {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(hyper::http::Error::from)?;
    let value = HeaderValue::from_str(value).map_err(hyper::http::Error::from)?;
    headers.insert(name, value);
    Ok(())
}

fn build_request(method: &Method, url: &str, headers: &HeaderMap, body: RequestBody) -> Result<Request<RequestBody>> {
    let length = body.len();
    let streamed = matches!(body, RequestBody::File(_));
    let mut request = Request::builder().method(method.clone()).uri(url).body(body)?;
    *request.headers_mut() = headers.clone();
    if streamed {
        // Streamed bodies have no size hint; keep the upload out of chunked encoding.
        request.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(request)
}

/// Content type guessed from the key's extension
pub fn content_type_for(key: &str) -> &'static str {
    mime_guess::from_path(key)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// ETag comparison form: unquoted, lower case
pub(crate) fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_ascii_lowercase()
}

fn content_md5(data: &[u8]) -> String {
    BASE64.encode(md5::compute(data).0)
}

/// Section of a local file, checked to lie within the file.
pub(crate) async fn file_section(path: &Path, offset: u64, length: u64) -> Result<FileSection> {
    let size = tokio::fs::metadata(path).await?.len();
    let end = offset.checked_add(length).unwrap_or(u64::MAX);
    if size < end {
        return Err(StorageError::InvalidArgument(format!(
            "{} ends before byte {}",
            path.display(),
            end
        )));
    }
    Ok(FileSection::new(path, offset, length))
}

/// Client construction parameters
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    /// Token of the `Authorization` header
    pub vendor: String,
    pub retry: RetryPolicy,
    pub transfer: TransferSettings,
    /// Route bucket calls to the bucket's regional endpoint
    pub resolve_regions: bool,
    /// Log every request and response header at debug level
    pub log_headers: bool,
}

impl ClientOptions {
    pub fn new(endpoint: Endpoint, credentials: Credentials) -> Self {
        Self {
            endpoint,
            credentials,
            vendor: DEFAULT_VENDOR.to_string(),
            retry: RetryPolicy::default(),
            transfer: TransferSettings::default(),
            resolve_regions: true,
            log_headers: false,
        }
    }
}

struct ClientInner {
    executor: RequestExecutor,
    endpoint: EndpointSlot,
    regions: RegionResolver,
    transfer: TransferSettings,
    resolve_regions: bool,
}

/// Object storage client
///
/// Clone is cheap; clones share the connection pool, the default endpoint
/// and the region caches.
#[derive(Clone)]
pub struct StorageClient {
    inner: Arc<ClientInner>,
}

impl StorageClient {
    /// Create a client over a pooled HTTPS transport.
    pub fn new(options: ClientOptions, transport: &TransportOptions) -> Result<Self> {
        let transport = HyperTransport::new(transport)?;
        Ok(Self::with_transport(Arc::new(transport), options))
    }

    /// Create a client over any transport.
    pub fn with_transport(transport: Arc<dyn HttpTransport>, options: ClientOptions) -> Self {
        let signer = Signer::new(options.credentials, options.vendor);
        let executor = RequestExecutor::new(transport, signer, options.retry)
            .with_header_logging(options.log_headers);

        Self {
            inner: Arc::new(ClientInner {
                executor,
                endpoint: EndpointSlot::new(options.endpoint),
                regions: RegionResolver::new(),
                transfer: options.transfer,
                resolve_regions: options.resolve_regions,
            }),
        }
    }

    /// Current default endpoint
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.get()
    }

    /// Replace the default endpoint, returning the previous one.
    pub fn set_endpoint(&self, endpoint: Endpoint) -> Endpoint {
        self.inner.endpoint.set(endpoint)
    }

    /// Replace the default endpoint until the guard is dropped.
    pub fn override_endpoint(&self, endpoint: Endpoint) -> EndpointGuard {
        self.inner.endpoint.scoped(endpoint)
    }

    pub fn transfer_settings(&self) -> &TransferSettings {
        &self.inner.transfer
    }

    async fn send(
        &self,
        executor: &RequestExecutor,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Bytes>> {
        executor
            .execute(|| std::future::ready(build_request(&method, url, &headers, body.clone().into())))
            .await
    }

    async fn call(&self, method: Method, url: &str, headers: HeaderMap, body: Bytes) -> Result<Response<Bytes>> {
        self.send(&self.inner.executor, method, url, headers, body).await
    }

    async fn call_xml<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<T> {
        let response = self.call(method, url, headers, body).await?;
        decode_xml(response.body())
    }

    // =========================================================================
    // Regions
    // =========================================================================

    /// Region directory. Fetched without signing.
    pub async fn get_regions(&self) -> Result<RegionDirectory> {
        debug!("Storage API call: GET regions");
        let url = self.endpoint().url("", "", &query(&[("regions", "")]));
        let anonymous = self.inner.executor.anonymous();
        let response = self
            .send(&anonymous, Method::GET, &url, HeaderMap::new(), Bytes::new())
            .await?;
        decode_xml(response.body())
    }

    /// Region name of a bucket; empty for the default region.
    pub async fn get_bucket_location(&self, bucket: &str) -> Result<String> {
        debug!(bucket, "Storage API call: GET bucket location");
        let url = self.endpoint().url(bucket, "", &query(&[("location", "")]));
        let location: LocationConstraint = self.call_xml(Method::GET, &url, HeaderMap::new(), Bytes::new()).await?;
        Ok(location.region.trim().to_string())
    }

    /// Endpoint of a named region. Unknown or empty regions map to the
    /// default endpoint.
    pub async fn region_endpoint(&self, region: &str) -> Result<Endpoint> {
        let default = self.endpoint();
        if region.is_empty() || !self.inner.resolve_regions {
            return Ok(default);
        }

        let directory = match self.inner.regions.cached_directory() {
            Some(directory) => directory,
            None => {
                let directory = self.get_regions().await?;
                self.inner.regions.remember_directory(directory.clone());
                directory
            }
        };
        Ok(directory.select(region, &default))
    }

    /// Endpoint serving a bucket
    pub async fn bucket_endpoint(&self, bucket: &str) -> Result<Endpoint> {
        if !self.inner.resolve_regions {
            return Ok(self.endpoint());
        }

        let region = match self.inner.regions.cached_location(bucket) {
            Some(region) => region,
            None => {
                let region = self.get_bucket_location(bucket).await?;
                self.inner.regions.remember_location(bucket, &region);
                region
            }
        };
        self.region_endpoint(&region).await
    }

    async fn service_endpoint(&self, region: Option<&str>) -> Result<Endpoint> {
        match region {
            Some(region) => self.region_endpoint(region).await,
            None => Ok(self.endpoint()),
        }
    }

    // =========================================================================
    // Service
    // =========================================================================

    pub async fn list_buckets(&self) -> Result<BucketListing> {
        debug!("Storage API call: GET service");
        let url = self.endpoint().url("", "", &Query::new());
        self.call_xml(Method::GET, &url, HeaderMap::new(), Bytes::new()).await
    }

    pub async fn get_storage_space(&self, region: Option<&str>) -> Result<StorageSpace> {
        debug!(?region, "Storage API call: GET service space");
        let url = self.service_endpoint(region).await?.url("", "", &query(&[("space", "")]));
        self.call_xml(Method::GET, &url, HeaderMap::new(), Bytes::new()).await
    }

    /// Daily downstream traffic, going back `backward_to` months.
    pub async fn list_network_traffics(&self, backward_to: u32, region: Option<&str>) -> Result<TrafficListing> {
        debug!(backward_to, ?region, "Storage API call: GET service traffic");
        let months = backward_to.to_string();
        let url = self
            .service_endpoint(region)
            .await?
            .url("", "", &query(&[("traffic", ""), ("backwardTo", &months)]));
        self.call_xml(Method::GET, &url, HeaderMap::new(), Bytes::new()).await
    }

    /// Downstream traffic of one charge date (`YYYYMMDD`).
    pub async fn get_network_traffic(&self, date: &str, region: Option<&str>) -> Result<Option<DownTraffic>> {
        debug!(date, ?region, "Storage API call: GET service traffic");
        let url = self
            .service_endpoint(region)
            .await?
            .url("", "", &query(&[("traffic", ""), ("chargeDate", date)]));
        let listing: TrafficListing = self.call_xml(Method::GET, &url, HeaderMap::new(), Bytes::new()).await?;
        Ok(listing.traffics.into_iter().next())
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    /// Create a bucket in the default region.
    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        info!(bucket, "Creating bucket");
        let url = self.endpoint().url(bucket, "", &Query::new());
        self.call(Method::PUT, &url, HeaderMap::new(), Bytes::new()).await?;
        Ok(())
    }

    /// Create a bucket at the endpoint of a named region.
    pub async fn create_bucket_in_region(&self, bucket: &str, region: &str) -> Result<()> {
        info!(bucket, region, "Creating bucket");
        let url = self.region_endpoint(region).await?.url(bucket, "", &Query::new());
        self.call(Method::PUT, &url, HeaderMap::new(), Bytes::new()).await?;
        self.inner.regions.remember_location(bucket, region);
        Ok(())
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        info!(bucket, "Deleting bucket");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, "", &Query::new());
        self.call(Method::DELETE, &url, HeaderMap::new(), Bytes::new()).await?;
        self.inner.regions.forget_location(bucket);
        Ok(())
    }

    /// `false` when the bucket does not exist; other failures are errors.
    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let endpoint = match self.bucket_endpoint(bucket).await {
            Ok(endpoint) => endpoint,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let url = endpoint.url(bucket, "", &Query::new());
        match self.call(Method::HEAD, &url, HeaderMap::new(), Bytes::new()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Bucket policy document
    pub async fn get_bucket_policy(&self, bucket: &str) -> Result<Bytes> {
        let url = self.bucket_endpoint(bucket).await?.url(bucket, "", &query(&[("policy", "")]));
        let response = self.call(Method::GET, &url, HeaderMap::new(), Bytes::new()).await?;
        Ok(response.into_body())
    }

    pub async fn put_bucket_policy(&self, bucket: &str, policy: Bytes) -> Result<()> {
        let url = self.bucket_endpoint(bucket).await?.url(bucket, "", &query(&[("policy", "")]));
        self.call(Method::PUT, &url, HeaderMap::new(), policy).await?;
        Ok(())
    }

    pub async fn delete_bucket_policy(&self, bucket: &str) -> Result<()> {
        let url = self.bucket_endpoint(bucket).await?.url(bucket, "", &query(&[("policy", "")]));
        self.call(Method::DELETE, &url, HeaderMap::new(), Bytes::new()).await?;
        Ok(())
    }

    // =========================================================================
    // Listings
    // =========================================================================

    pub async fn list_objects(&self, request: &ListObjectsRequest) -> Result<ObjectListing> {
        debug!(bucket = %request.bucket, prefix = %request.prefix, marker = %request.marker, "Storage API call: GET bucket");
        let url = self
            .bucket_endpoint(&request.bucket)
            .await?
            .url(&request.bucket, "", &request.query());
        self.call_xml(Method::GET, &url, HeaderMap::new(), Bytes::new()).await
    }

    /// Page following `listing`
    pub async fn next_list_objects(&self, listing: &ObjectListing) -> Result<ObjectListing> {
        self.list_objects(&listing.next_page_request()?).await
    }

    pub async fn list_multipart_uploads(&self, request: &ListUploadsRequest) -> Result<MultipartUploadListing> {
        debug!(bucket = %request.bucket, "Storage API call: GET bucket uploads");
        let url = self
            .bucket_endpoint(&request.bucket)
            .await?
            .url(&request.bucket, "", &request.query());
        let mut listing: MultipartUploadListing = self.call_xml(Method::GET, &url, HeaderMap::new(), Bytes::new()).await?;
        listing.common_prefixes.retain(|p| !p.prefix.is_empty());
        Ok(listing)
    }

    pub async fn next_list_multipart_uploads(&self, listing: &MultipartUploadListing) -> Result<MultipartUploadListing> {
        self.list_multipart_uploads(&listing.next_page_request()?).await
    }

    // =========================================================================
    // Objects
    // =========================================================================

    fn object_headers(key: &str, metadata: Option<&ObjectMetadata>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(metadata) = metadata {
            metadata.apply_to(&mut headers)?;
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type_for(key)));
        }
        Ok(headers)
    }

    /// Upload a whole file as one object.
    pub async fn put_object(&self, bucket: &str, key: &str, path: &Path, metadata: Option<&ObjectMetadata>) -> Result<()> {
        let length = tokio::fs::metadata(path).await?.len();
        self.put_object_range(bucket, key, path, 0, length, metadata).await
    }

    /// Upload `length` bytes of a file starting at `offset`. The range is
    /// re-read on every attempt.
    pub async fn put_object_range(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        offset: u64,
        length: u64,
        metadata: Option<&ObjectMetadata>,
    ) -> Result<()> {
        debug!(bucket, key, offset, length, "Storage API call: PUT object");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, key, &Query::new());
        let headers = Self::object_headers(key, metadata)?;

        self.inner
            .executor
            .execute(|| {
                let headers = headers.clone();
                let url = url.clone();
                async move {
                    let section = file_section(path, offset, length).await?;
                    build_request(&Method::PUT, &url, &headers, section.into())
                }
            })
            .await?;
        Ok(())
    }

    /// Upload an in-memory object.
    pub async fn put_object_bytes(&self, bucket: &str, key: &str, data: Bytes, metadata: Option<&ObjectMetadata>) -> Result<()> {
        debug!(bucket, key, length = data.len(), "Storage API call: PUT object");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, key, &Query::new());
        let headers = Self::object_headers(key, metadata)?;
        self.call(Method::PUT, &url, headers, data).await?;
        Ok(())
    }

    /// Server-side copy of a whole object. Returns the new ETag.
    pub async fn copy_object(&self, src_bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> Result<String> {
        debug!(src_bucket, src_key, dst_bucket, dst_key, "Storage API call: PUT object copy");
        let url = self.bucket_endpoint(dst_bucket).await?.url(dst_bucket, dst_key, &Query::new());
        let mut headers = HeaderMap::new();
        header(&mut headers, &copy_source_header(), &copy_source(src_bucket, src_key))?;

        let result: CopyPartResult = self.call_xml(Method::PUT, &url, headers, Bytes::new()).await?;
        Ok(result.etag)
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        debug!(bucket, key, "Storage API call: GET object");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, key, &Query::new());
        let response = self.call(Method::GET, &url, HeaderMap::new(), Bytes::new()).await?;
        Ok(response.into_body())
    }

    /// Download an object into a local file. Returns the byte count.
    ///
    /// The body is copied to the file as it arrives. Retries cover the
    /// request up to the response headers.
    pub async fn download_object_to_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64> {
        debug!(bucket, key, path = %path.display(), "Storage API call: GET object to file");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, key, &Query::new());
        let response = self
            .inner
            .executor
            .execute_streaming(|| std::future::ready(build_request(&Method::GET, &url, &HeaderMap::new(), RequestBody::empty())))
            .await?;

        let mut reader = StreamReader::new(response.into_body().into_data_stream().map_err(io::Error::other));
        let mut file = tokio::fs::File::create(path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }

    /// HEAD of an object; `None` when it does not exist.
    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        debug!(bucket, key, "Storage API call: HEAD object");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, key, &Query::new());
        match self.call(Method::HEAD, &url, HeaderMap::new(), Bytes::new()).await {
            Ok(response) => Ok(Some(ObjectInfo::from_headers(bucket, key, response.headers()))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.get_object_metadata(bucket, key).await?.is_some())
    }

    /// Listing entry of exactly `key`
    pub async fn get_object_summary(&self, bucket: &str, key: &str) -> Result<Option<ObjectSummary>> {
        let request = ListObjectsRequest::new(bucket).with_prefix(key).with_max_keys(1);
        let listing = self.list_objects(&request).await?;
        Ok(listing.contents.into_iter().find(|o| o.key == key))
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        debug!(bucket, key, "Storage API call: DELETE object");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, key, &Query::new());
        self.call(Method::DELETE, &url, HeaderMap::new(), Bytes::new()).await?;
        Ok(())
    }

    /// Delete several keys with one request. In quiet mode only failures
    /// are reported.
    pub async fn delete_multiple_objects<S: AsRef<str>>(&self, bucket: &str, keys: &[S], quiet: bool) -> Result<DeletionResult> {
        debug!(bucket, count = keys.len(), "Storage API call: POST delete");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, "", &query(&[("delete", "")]));
        let body = Bytes::from(delete_objects_xml(keys, quiet));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        header(&mut headers, "content-md5", &content_md5(&body))?;

        let response = self.call(Method::POST, &url, headers, body).await?;
        if response.body().is_empty() {
            return Ok(DeletionResult::default());
        }
        decode_xml(response.body())
    }

    // =========================================================================
    // Multipart uploads
    // =========================================================================

    pub async fn initiate_multipart_upload(&self, bucket: &str, key: &str, metadata: Option<&ObjectMetadata>) -> Result<MultipartUpload> {
        debug!(bucket, key, "Storage API call: POST initiate multipart upload");
        let url = self.bucket_endpoint(bucket).await?.url(bucket, key, &query(&[("uploads", "")]));
        let headers = Self::object_headers(key, metadata)?;
        self.call_xml(Method::POST, &url, headers, Bytes::new()).await
    }

    /// Upload a whole file as one part.
    pub async fn upload_part(&self, upload: &MultipartUpload, part_number: u32, path: &Path) -> Result<Part> {
        let length = tokio::fs::metadata(path).await?.len();
        self.upload_part_range(upload, part_number, path, 0, length).await
    }

    /// Upload a byte range of a file as one part.
    ///
    /// The ETag of the returned part is the locally computed MD5; a server
    /// ETag that disagrees fails with [`StorageError::EtagMismatch`].
    pub async fn upload_part_range(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        path: &Path,
        offset: u64,
        length: u64,
    ) -> Result<Part> {
        check_part_number(part_number)?;
        debug!(bucket = %upload.bucket, key = %upload.key, part_number, offset, length, "Storage API call: PUT part");

        let number = part_number.to_string();
        let url = self
            .bucket_endpoint(&upload.bucket)
            .await?
            .url(&upload.bucket, &upload.key, &query(&[("partNumber", &number), ("uploadId", &upload.upload_id)]));

        // Each attempt streams the section again into a fresh digest.
        let digest = Mutex::new(BodyDigest::new());
        let response = self
            .inner
            .executor
            .execute(|| {
                let url = url.clone();
                let digest = &digest;
                async move {
                    let attempt_digest = BodyDigest::new();
                    let section = file_section(path, offset, length).await?.with_digest(attempt_digest.clone());
                    *digest.lock().unwrap_or_else(PoisonError::into_inner) = attempt_digest;
                    build_request(&Method::PUT, &url, &HeaderMap::new(), section.into())
                }
            })
            .await?;

        let digest = digest.into_inner().unwrap_or_else(PoisonError::into_inner);
        if digest.len() != length {
            return Err(StorageError::Transport(format!(
                "part {} sent {} of {} bytes",
                part_number,
                digest.len(),
                length
            )));
        }
        let expected = digest.quoted_hex();
        let actual = response
            .headers()
            .get(ETAG)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();
        if !actual.is_empty() && normalize_etag(&actual) != normalize_etag(&expected) {
            return Err(StorageError::EtagMismatch {
                part_number,
                expected,
                actual,
            });
        }
        Ok(Part::new(part_number, expected))
    }

    /// Copy an inclusive byte range of an object, or the whole object, as
    /// one part.
    pub async fn upload_part_copy(
        &self,
        upload: &MultipartUpload,
        part_number: u32,
        src_bucket: &str,
        src_key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Part> {
        check_part_number(part_number)?;
        debug!(bucket = %upload.bucket, key = %upload.key, part_number, ?range, "Storage API call: PUT part copy");

        let number = part_number.to_string();
        let url = self
            .bucket_endpoint(&upload.bucket)
            .await?
            .url(&upload.bucket, &upload.key, &query(&[("partNumber", &number), ("uploadId", &upload.upload_id)]));

        let mut headers = HeaderMap::new();
        header(&mut headers, &copy_source_header(), &copy_source(src_bucket, src_key))?;
        if let Some((first, last)) = range {
            header(
                &mut headers,
                &format!("{}copy-source-range", VENDOR_HEADER_PREFIX),
                &format!("bytes={}-{}", first, last),
            )?;
        }

        let result: CopyPartResult = self.call_xml(Method::PUT, &url, headers, Bytes::new()).await?;
        Ok(Part::new(part_number, result.etag))
    }

    pub async fn list_parts(&self, request: &ListPartsRequest) -> Result<PartListing> {
        debug!(bucket = %request.bucket, key = %request.key, upload_id = %request.upload_id, "Storage API call: GET parts");
        let url = self
            .bucket_endpoint(&request.bucket)
            .await?
            .url(&request.bucket, &request.key, &request.query());
        self.call_xml(Method::GET, &url, HeaderMap::new(), Bytes::new()).await
    }

    pub async fn next_list_parts(&self, listing: &PartListing) -> Result<PartListing> {
        self.list_parts(&listing.next_page_request()?).await
    }

    /// Complete an upload. Parts are sent in ascending part number order.
    pub async fn complete_multipart_upload(&self, upload: &MultipartUpload, parts: &[Part]) -> Result<CompleteMultipartUploadResult> {
        debug!(bucket = %upload.bucket, key = %upload.key, parts = parts.len(), "Storage API call: POST complete multipart upload");
        let mut sorted = parts.to_vec();
        sorted.sort_by_key(|p| p.part_number);

        let url = self
            .bucket_endpoint(&upload.bucket)
            .await?
            .url(&upload.bucket, &upload.key, &query(&[("uploadId", &upload.upload_id)]));
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));

        let body = Bytes::from(complete_multipart_upload_xml(&sorted));
        self.call_xml(Method::POST, &url, headers, body).await
    }

    pub async fn abort_multipart_upload(&self, upload: &MultipartUpload) -> Result<()> {
        debug!(bucket = %upload.bucket, key = %upload.key, upload_id = %upload.upload_id, "Storage API call: DELETE multipart upload");
        let url = self
            .bucket_endpoint(&upload.bucket)
            .await?
            .url(&upload.bucket, &upload.key, &query(&[("uploadId", &upload.upload_id)]));
        self.call(Method::DELETE, &url, HeaderMap::new(), Bytes::new()).await?;
        Ok(())
    }
}

fn copy_source_header() -> String {
    format!("{}copy-source", VENDOR_HEADER_PREFIX)
}

fn copy_source(bucket: &str, key: &str) -> String {
    encode_component(&format!("/{}/{}", bucket, key)).into_owned()
}

fn check_part_number(part_number: u32) -> Result<()> {
    if !(1..=10_000).contains(&part_number) {
        return Err(StorageError::InvalidArgument(format!(
            "part number {} outside 1..=10000",
            part_number
        )));
    }
    Ok(())
}
