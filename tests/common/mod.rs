//! In-memory storage service for integration tests
//!
//! `FakeStorage` implements the transport seam, so a real `StorageClient`
//! runs its whole protocol stack (signing, retries, XML decoding) against
//! it. Buckets, objects and multipart sessions are kept in memory, every
//! request is recorded, and failures can be injected per part.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stowage::s3::canonical::{parse_query, percent_decode};
use stowage::s3::{
    ClientOptions, Credentials, Endpoint, HttpTransport, RequestBody, RetryPolicy, StorageClient, TransferSettings,
};
use tokio::sync::Semaphore;

pub const DEFAULT_HOST: &str = "storage.test";

const COPY_SOURCE: &str = "x-iijgio-copy-source";
const COPY_SOURCE_RANGE: &str = "x-iijgio-copy-source-range";

/// A request as seen by the fake service
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub host: String,
    /// Decoded path
    pub path: String,
    pub query: BTreeMap<String, Vec<String>>,
    pub headers: HeaderMap,
    pub body_len: usize,
}

impl RecordedRequest {
    pub fn has_query(&self, name: &str) -> bool {
        self.query.contains_key(name)
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn part_number(&self) -> Option<u32> {
        self.query_value("partNumber").and_then(|v| v.parse().ok())
    }

    /// PUT of a part from a body (not a copy)
    pub fn is_part_upload(&self) -> bool {
        self.method == Method::PUT && self.part_number().is_some() && !self.headers.contains_key(COPY_SOURCE)
    }

    pub fn is_part_copy(&self) -> bool {
        self.method == Method::PUT && self.part_number().is_some() && self.headers.contains_key(COPY_SOURCE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Part(u32),
    Complete,
    Initiate,
}

#[derive(Debug)]
struct Failure {
    target: Target,
    remaining: usize,
    status: u16,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    meta: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Session {
    bucket: String,
    key: String,
    content_type: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct BucketState {
    region: String,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Debug, Default)]
struct State {
    /// Region name to host
    regions: BTreeMap<String, String>,
    buckets: BTreeMap<String, BucketState>,
    uploads: BTreeMap<String, Session>,
    next_upload: u32,
    requests: Vec<RecordedRequest>,
    failures: Vec<Failure>,
    parts_page_size: Option<u32>,
    stalled_part_listing: bool,
    bad_etag_part: Option<u32>,
    part_delays: BTreeMap<u32, Duration>,
    /// Bodies of CompleteMultipartUpload requests, in arrival order
    completions: Vec<String>,
    location: Option<String>,
}

/// Stateful in-memory storage service
#[derive(Debug, Default)]
pub struct FakeStorage {
    state: Mutex<State>,
    part_gate: Mutex<Option<Arc<Semaphore>>>,
    part_arrivals: AtomicUsize,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_region(&self, name: &str, host: &str) {
        self.state().regions.insert(name.to_string(), host.to_string());
    }

    /// Create a bucket; an empty region is the default one.
    pub fn add_bucket(&self, bucket: &str, region: &str) {
        self.state().buckets.insert(
            bucket.to_string(),
            BucketState {
                region: region.to_string(),
                ..Default::default()
            },
        );
    }

    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut state = self.state();
        let bucket = state.buckets.get_mut(bucket).expect("bucket exists");
        bucket.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: "application/octet-stream".to_string(),
                meta: Vec::new(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.data.clone())
    }

    pub fn object_content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.content_type.clone())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Open a session directly, bypassing the client.
    pub fn start_upload(&self, bucket: &str, key: &str) -> String {
        let mut state = self.state();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Session {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: "application/octet-stream".to_string(),
                parts: BTreeMap::new(),
            },
        );
        upload_id
    }

    pub fn store_part(&self, upload_id: &str, part_number: u32, data: impl Into<Bytes>) {
        let mut state = self.state();
        let session = state.uploads.get_mut(upload_id).expect("session exists");
        session.parts.insert(part_number, data.into());
    }

    /// Ids of sessions that are neither completed nor aborted
    pub fn open_uploads(&self) -> Vec<String> {
        self.state().uploads.keys().cloned().collect()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Part numbers of every part PUT with a body, in arrival order
    pub fn part_uploads(&self) -> Vec<u32> {
        self.requests()
            .iter()
            .filter(|r| r.is_part_upload())
            .filter_map(|r| r.part_number())
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&RecordedRequest) -> bool) -> usize {
        self.requests().iter().filter(|r| pred(r)).count()
    }

    /// Answer the next `times` uploads of a part with `status`.
    pub fn fail_part(&self, part_number: u32, times: usize, status: u16) {
        self.push_failure(Target::Part(part_number), times, status);
    }

    pub fn fail_complete(&self, times: usize, status: u16) {
        self.push_failure(Target::Complete, times, status);
    }

    pub fn fail_initiate(&self, times: usize, status: u16) {
        self.push_failure(Target::Initiate, times, status);
    }

    fn push_failure(&self, target: Target, times: usize, status: u16) {
        self.state().failures.push(Failure {
            target,
            remaining: times,
            status,
        });
    }

    /// Limit part listings to `size` entries per page.
    pub fn set_parts_page_size(&self, size: u32) {
        self.state().parts_page_size = Some(size);
    }

    /// Answer every part listing as truncated without a next marker.
    pub fn stall_part_listing(&self) {
        self.state().stalled_part_listing = true;
    }

    /// Hold uploads of this part for `delay` before answering.
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state().part_delays.insert(part_number, delay);
    }

    /// Hold every part upload until a permit is added to the returned gate.
    pub fn gate_part_uploads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.part_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Part uploads that reached the service, answered or held
    pub fn part_arrivals(&self) -> usize {
        self.part_arrivals.load(Ordering::SeqCst)
    }

    /// Bodies of every completion request received
    pub fn completions(&self) -> Vec<String> {
        self.state().completions.clone()
    }

    /// Location reported by completions instead of the object URL.
    pub fn set_location(&self, location: &str) {
        self.state().location = Some(location.to_string());
    }

    /// Return a wrong ETag header for uploads of this part.
    pub fn corrupt_etag(&self, part_number: u32) {
        self.state().bad_etag_part = Some(part_number);
    }

    fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        let uri = request.uri().clone();
        let host = uri.host().unwrap_or_default().to_string();
        let path = percent_decode(uri.path(), false);
        let query = parse_query(uri.query().unwrap_or(""));
        let recorded = RecordedRequest {
            method: request.method().clone(),
            host,
            path,
            query,
            headers: request.headers().clone(),
            body_len: request.body().len(),
        };

        let mut state = self.state();
        state.requests.push(recorded.clone());

        if let Some(response) = injected_failure(&mut state, &recorded) {
            return response;
        }
        route(&mut state, &recorded, request.body())
    }
}

#[async_trait]
impl HttpTransport for FakeStorage {
    async fn send(&self, request: Request<RequestBody>) -> stowage::s3::Result<Response<Bytes>> {
        let (parts, body) = request.into_parts();
        if let Some(part_number) = uploaded_part(&parts) {
            self.part_arrivals.fetch_add(1, Ordering::SeqCst);
            let gate = self.part_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.acquire().await.expect("gate open").forget();
            }
            let delay = self.state().part_delays.get(&part_number).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
        let body = body.into_bytes().await?;
        Ok(self.handle(Request::from_parts(parts, body)))
    }
}

/// Part number of a part PUT carrying a body
fn uploaded_part(parts: &hyper::http::request::Parts) -> Option<u32> {
    if parts.method != Method::PUT || parts.headers.contains_key(COPY_SOURCE) {
        return None;
    }
    parse_query(parts.uri.query().unwrap_or(""))
        .get("partNumber")
        .and_then(|v| v.first())
        .and_then(|v| v.parse().ok())
}

/// Client over `fake` with fast retries and a small chunk size
pub fn client(fake: &Arc<FakeStorage>, chunk_size: u64, concurrency: usize) -> StorageClient {
    StorageClient::with_transport(fake.clone(), options(chunk_size, concurrency))
}

pub fn options(chunk_size: u64, concurrency: usize) -> ClientOptions {
    let mut options = ClientOptions::new(Endpoint::new(DEFAULT_HOST, true), Credentials::new("AK", "SK"));
    options.retry = RetryPolicy {
        retries: 2,
        interval: Duration::ZERO,
    };
    options.transfer = TransferSettings {
        chunk_size,
        concurrency,
        ..TransferSettings::default()
    };
    options
}

/// `len` bytes of a repeating, position dependent pattern
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

// =============================================================================
// Routing
// =============================================================================

fn target_of(request: &RecordedRequest) -> Option<Target> {
    if request.method == Method::PUT {
        return request.part_number().map(Target::Part);
    }
    if request.method == Method::POST && request.has_query("uploadId") {
        return Some(Target::Complete);
    }
    if request.method == Method::POST && request.has_query("uploads") {
        return Some(Target::Initiate);
    }
    None
}

fn injected_failure(state: &mut State, request: &RecordedRequest) -> Option<Response<Bytes>> {
    let target = target_of(request)?;
    let failure = state
        .failures
        .iter_mut()
        .find(|f| f.target == target && f.remaining > 0)?;
    failure.remaining -= 1;
    let status = failure.status;
    Some(error(status, "InternalError"))
}

fn route(state: &mut State, request: &RecordedRequest, body: &Bytes) -> Response<Bytes> {
    let trimmed = request.path.trim_start_matches('/');
    let (bucket, key) = match trimmed.split_once('/') {
        Some((bucket, key)) => (bucket.to_string(), key.to_string()),
        None => (trimmed.to_string(), String::new()),
    };

    if bucket.is_empty() {
        return service(state, request);
    }

    if request.has_query("location") {
        return match state.buckets.get(&bucket) {
            Some(b) if b.region.is_empty() => xml("<LocationConstraint/>".to_string()),
            Some(b) => xml(format!("<LocationConstraint>{}</LocationConstraint>", b.region)),
            None => error(404, "NoSuchBucket"),
        };
    }

    if request.method == Method::PUT && key.is_empty() && !request.has_query("policy") {
        let region = state
            .regions
            .iter()
            .find(|(_, host)| **host == request.host)
            .map(|(name, _)| name.clone())
            .unwrap_or_default();
        state.buckets.insert(
            bucket,
            BucketState {
                region,
                ..Default::default()
            },
        );
        return empty(200);
    }

    let Some(region) = state.buckets.get(&bucket).map(|b| b.region.clone()) else {
        return error(404, "NoSuchBucket");
    };
    let expected_host = state
        .regions
        .get(&region)
        .cloned()
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    if request.host != expected_host {
        return error(301, "PermanentRedirect");
    }

    if key.is_empty() {
        bucket_request(state, request, &bucket, body)
    } else {
        object_request(state, request, &bucket, &key, body)
    }
}

fn service(state: &State, request: &RecordedRequest) -> Response<Bytes> {
    if request.has_query("regions") {
        let mut body = String::from("<Regions>");
        for (name, host) in &state.regions {
            let _ = write!(body, "<Region><Name>{}</Name><Endpoint>{}</Endpoint></Region>", name, host);
        }
        body.push_str("</Regions>");
        return xml(body);
    }
    if request.has_query("space") {
        let used: usize = state
            .buckets
            .values()
            .flat_map(|b| b.objects.values())
            .map(|o| o.data.len())
            .sum();
        return xml(format!(
            "<StorageSpace><ContractUsed>{}</ContractUsed><AccountUsed>{}</AccountUsed></StorageSpace>",
            used, used
        ));
    }
    if request.has_query("traffic") {
        let body = match request.query_value("chargeDate") {
            Some("20240101") => "<TrafficListing><DownTraffics><ChargeDate>20240101</ChargeDate><Amount>42</Amount></DownTraffics></TrafficListing>".to_string(),
            Some(_) => "<TrafficListing></TrafficListing>".to_string(),
            None => "<TrafficListing>\
                <DownTraffics><ChargeDate>20240101</ChargeDate><Amount>42</Amount></DownTraffics>\
                <DownTraffics><ChargeDate>20240102</ChargeDate><Amount>7</Amount></DownTraffics>\
                </TrafficListing>"
                .to_string(),
        };
        return xml(body);
    }

    let mut body = String::from("<ListAllMyBucketsResult><Owner><ID>owner</ID><DisplayName>Owner</DisplayName></Owner><Buckets>");
    for (name, bucket) in &state.buckets {
        let _ = write!(
            body,
            "<Bucket><Name>{}</Name><CreationDate>2024-01-01T00:00:00.000Z</CreationDate><LocationConstraint>{}</LocationConstraint></Bucket>",
            name, bucket.region
        );
    }
    body.push_str("</Buckets></ListAllMyBucketsResult>");
    xml(body)
}

fn bucket_request(state: &mut State, request: &RecordedRequest, bucket: &str, body: &Bytes) -> Response<Bytes> {
    if request.has_query("policy") {
        return match request.method {
            Method::GET => Response::builder()
                .status(200)
                .header(CONTENT_TYPE, "application/json")
                .body(Bytes::from_static(b"{\"Statement\":[]}"))
                .unwrap(),
            _ => empty(204),
        };
    }

    match request.method {
        Method::HEAD => empty(200),
        Method::DELETE => {
            state.buckets.remove(bucket);
            empty(204)
        }
        Method::POST if request.has_query("delete") => delete_objects(state, bucket, body),
        Method::GET if request.has_query("uploads") => list_uploads(state, bucket),
        Method::GET => list_objects(state, request, bucket),
        _ => error(400, "InvalidRequest"),
    }
}

fn list_objects(state: &State, request: &RecordedRequest, bucket: &str) -> Response<Bytes> {
    let prefix = request.query_value("prefix").unwrap_or_default();
    let marker = request.query_value("marker").unwrap_or_default();
    let delimiter = request.query_value("delimiter").unwrap_or_default();
    let max_keys: usize = request
        .query_value("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    // Entries are keys, or rolled-up prefixes when a delimiter is set.
    let mut entries: Vec<(String, Option<&StoredObject>)> = Vec::new();
    for (key, object) in &state.buckets[bucket].objects {
        if !key.starts_with(prefix) || key.as_str() <= marker {
            continue;
        }
        let rest = &key[prefix.len()..];
        match rest.find(delimiter).filter(|_| !delimiter.is_empty()) {
            Some(pos) => {
                let rolled = format!("{}{}", prefix, &rest[..pos + delimiter.len()]);
                if rolled.as_str() > marker && entries.last().map(|(k, _)| k != &rolled).unwrap_or(true) {
                    entries.push((rolled, None));
                }
            }
            None => entries.push((key.clone(), Some(object))),
        }
    }

    let truncated = entries.len() > max_keys;
    entries.truncate(max_keys);

    let mut body = String::from("<ListBucketResult>");
    let _ = write!(
        body,
        "<Name>{}</Name><Prefix>{}</Prefix><Marker>{}</Marker><MaxKeys>{}</MaxKeys><Delimiter>{}</Delimiter><IsTruncated>{}</IsTruncated>",
        bucket, prefix, marker, max_keys, delimiter, truncated
    );
    if truncated && !delimiter.is_empty() {
        if let Some((last, _)) = entries.last() {
            let _ = write!(body, "<NextMarker>{}</NextMarker>", last);
        }
    }
    for (key, object) in &entries {
        match object {
            Some(object) => {
                let _ = write!(
                    body,
                    "<Contents><Key>{}</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>{}</ETag><Size>{}</Size><StorageClass>STANDARD</StorageClass></Contents>",
                    key,
                    xml_quoted_md5(&object.data),
                    object.data.len()
                );
            }
            None => {
                let _ = write!(body, "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>", key);
            }
        }
    }
    body.push_str("</ListBucketResult>");
    xml(body)
}

fn list_uploads(state: &State, bucket: &str) -> Response<Bytes> {
    let mut body = format!(
        "<ListMultipartUploadsResult><Bucket>{}</Bucket><IsTruncated>false</IsTruncated>",
        bucket
    );
    for (upload_id, session) in state.uploads.iter().filter(|(_, s)| s.bucket == bucket) {
        let _ = write!(
            body,
            "<Upload><Key>{}</Key><UploadId>{}</UploadId><StorageClass>STANDARD</StorageClass><Initiated>2024-01-01T00:00:00.000Z</Initiated></Upload>",
            session.key, upload_id
        );
    }
    // Some servers report an empty rolled-up prefix.
    body.push_str("<CommonPrefixes><Prefix></Prefix></CommonPrefixes>");
    body.push_str("</ListMultipartUploadsResult>");
    xml(body)
}

fn delete_objects(state: &mut State, bucket: &str, body: &Bytes) -> Response<Bytes> {
    let text = String::from_utf8_lossy(body);
    let quiet = tag_values(&text, "Quiet").first().map(|v| v == "true").unwrap_or(false);
    let objects = &mut state.buckets.get_mut(bucket).expect("bucket exists").objects;

    let mut response = String::from("<DeleteResult>");
    for key in tag_values(&text, "Key") {
        if objects.remove(&key).is_some() {
            if !quiet {
                let _ = write!(response, "<Deleted><Key>{}</Key></Deleted>", key);
            }
        } else {
            let _ = write!(
                response,
                "<Error><Key>{}</Key><Code>NoSuchKey</Code><Message>missing</Message></Error>",
                key
            );
        }
    }
    response.push_str("</DeleteResult>");
    xml(response)
}

fn object_request(
    state: &mut State,
    request: &RecordedRequest,
    bucket: &str,
    key: &str,
    body: &Bytes,
) -> Response<Bytes> {
    if request.has_query("uploads") && request.method == Method::POST {
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Session {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: request.header("content-type").unwrap_or_default().to_string(),
                parts: BTreeMap::new(),
            },
        );
        return xml(format!(
            "<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
            bucket, key, upload_id
        ));
    }

    if let Some(upload_id) = request.query_value("uploadId").map(str::to_string) {
        if !state.uploads.contains_key(&upload_id) {
            return error(404, "NoSuchUpload");
        }
        return match request.method {
            Method::PUT => upload_part(state, request, &upload_id, body),
            Method::GET => list_parts(state, request, &upload_id),
            Method::POST => complete(state, bucket, key, &upload_id, body),
            Method::DELETE => {
                state.uploads.remove(&upload_id);
                empty(204)
            }
            _ => error(400, "InvalidRequest"),
        };
    }

    if request.method == Method::PUT && request.headers.contains_key(COPY_SOURCE) {
        let Some(data) = copy_source_data(state, request) else {
            return error(404, "NoSuchKey");
        };
        let etag = xml_quoted_md5(&data);
        state.buckets.get_mut(bucket).expect("bucket exists").objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: "application/octet-stream".to_string(),
                meta: Vec::new(),
            },
        );
        return xml(format!(
            "<CopyObjectResult><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>{}</ETag></CopyObjectResult>",
            etag
        ));
    }

    let objects = &mut state.buckets.get_mut(bucket).expect("bucket exists").objects;
    match request.method {
        Method::PUT => {
            let meta = request
                .headers
                .iter()
                .filter(|(name, _)| name.as_str().starts_with("x-iijgio-meta-"))
                .map(|(name, value)| (name.as_str().to_string(), value.to_str().unwrap_or_default().to_string()))
                .collect();
            objects.insert(
                key.to_string(),
                StoredObject {
                    data: body.clone(),
                    content_type: request.header("content-type").unwrap_or_default().to_string(),
                    meta,
                },
            );
            let mut response = empty(200);
            response
                .headers_mut()
                .insert(ETAG, quoted_md5(body).parse().unwrap());
            response
        }
        Method::GET => match objects.get(key) {
            Some(object) => Response::builder()
                .status(200)
                .header(CONTENT_TYPE, object.content_type.as_str())
                .body(object.data.clone())
                .unwrap(),
            None => error(404, "NoSuchKey"),
        },
        Method::HEAD => match objects.get(key) {
            Some(object) => {
                let mut builder = Response::builder()
                    .status(200)
                    .header(CONTENT_LENGTH, object.data.len())
                    .header(CONTENT_TYPE, object.content_type.as_str())
                    .header(ETAG, quoted_md5(&object.data))
                    .header("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT");
                for (name, value) in &object.meta {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                builder.body(Bytes::new()).unwrap()
            }
            // HEAD answers carry no body.
            None => empty(404),
        },
        Method::DELETE => {
            objects.remove(key);
            empty(204)
        }
        _ => error(400, "InvalidRequest"),
    }
}

fn copy_source_data(state: &State, request: &RecordedRequest) -> Option<Bytes> {
    let source = percent_decode(request.header(COPY_SOURCE)?, false);
    let (src_bucket, src_key) = source.trim_start_matches('/').split_once('/')?;
    let data = state.buckets.get(src_bucket)?.objects.get(src_key)?.data.clone();

    match request.header(COPY_SOURCE_RANGE) {
        Some(range) => {
            let (first, last) = range.strip_prefix("bytes=")?.split_once('-')?;
            let first: usize = first.parse().ok()?;
            let last: usize = last.parse().ok()?;
            Some(data.slice(first..=last.min(data.len() - 1)))
        }
        None => Some(data),
    }
}

fn upload_part(state: &mut State, request: &RecordedRequest, upload_id: &str, body: &Bytes) -> Response<Bytes> {
    let part_number = request.part_number().unwrap_or_default();
    if request.headers.contains_key(COPY_SOURCE) {
        let Some(data) = copy_source_data(state, request) else {
            return error(404, "NoSuchKey");
        };
        let etag = xml_quoted_md5(&data);
        state
            .uploads
            .get_mut(upload_id)
            .expect("session exists")
            .parts
            .insert(part_number, data);
        return xml(format!(
            "<CopyPartResult><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>{}</ETag></CopyPartResult>",
            etag
        ));
    }

    let etag = if state.bad_etag_part == Some(part_number) {
        "\"00000000000000000000000000000000\"".to_string()
    } else {
        quoted_md5(body)
    };
    state
        .uploads
        .get_mut(upload_id)
        .expect("session exists")
        .parts
        .insert(part_number, body.clone());
    let mut response = empty(200);
    response.headers_mut().insert(ETAG, etag.parse().unwrap());
    response
}

fn list_parts(state: &State, request: &RecordedRequest, upload_id: &str) -> Response<Bytes> {
    let session = &state.uploads[upload_id];
    let marker: u32 = request
        .query_value("part-number-marker")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let requested: usize = request
        .query_value("max-parts")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);
    let max_parts = state
        .parts_page_size
        .map(|size| (size as usize).min(requested))
        .unwrap_or(requested);

    let mut parts: Vec<(&u32, &Bytes)> = session.parts.range(marker + 1..).collect();
    let mut truncated = parts.len() > max_parts;
    parts.truncate(max_parts);
    let mut next_marker = parts.last().map(|(n, _)| **n).unwrap_or(marker);
    if state.stalled_part_listing {
        // Same page forever: truncated, no next marker and no parts.
        parts.clear();
        truncated = true;
        next_marker = 0;
    }

    let mut body = format!(
        "<ListPartsResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId>\
         <PartNumberMarker>{}</PartNumberMarker><NextPartNumberMarker>{}</NextPartNumberMarker>\
         <MaxParts>{}</MaxParts><IsTruncated>{}</IsTruncated>",
        session.bucket, session.key, upload_id, marker, next_marker, max_parts, truncated
    );
    for (number, data) in parts {
        let _ = write!(
            body,
            "<Part><PartNumber>{}</PartNumber><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>{}</ETag><Size>{}</Size></Part>",
            number,
            xml_quoted_md5(data),
            data.len()
        );
    }
    body.push_str("</ListPartsResult>");
    xml(body)
}

fn complete(state: &mut State, bucket: &str, key: &str, upload_id: &str, body: &Bytes) -> Response<Bytes> {
    let text = String::from_utf8_lossy(body);
    state.completions.push(text.to_string());
    let numbers: Vec<u32> = tag_values(&text, "PartNumber")
        .iter()
        .filter_map(|n| n.parse().ok())
        .collect();
    let etags = tag_values(&text, "ETag");

    if numbers.is_empty() || numbers.windows(2).any(|w| w[0] >= w[1]) {
        return error(400, "InvalidPartOrder");
    }

    let session = &state.uploads[upload_id];
    let mut data = Vec::new();
    for (number, etag) in numbers.iter().zip(etags.iter()) {
        let Some(part) = session.parts.get(number) else {
            return error(400, "InvalidPart");
        };
        let etag = etag.replace("&quot;", "\"");
        if etag.trim_matches('"') != quoted_md5(part).trim_matches('"') {
            return error(400, "InvalidPart");
        }
        data.extend_from_slice(part);
    }

    let session = state.uploads.remove(upload_id).expect("session exists");
    let data = Bytes::from(data);
    let etag = format!("&quot;{:x}-{}&quot;", md5::compute(&data), numbers.len());
    state
        .buckets
        .get_mut(bucket)
        .expect("bucket exists")
        .objects
        .insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: session.content_type,
                meta: Vec::new(),
            },
        );

    let location = state
        .location
        .clone()
        .unwrap_or_else(|| format!("https://{}/{}/{}", DEFAULT_HOST, bucket, key));
    xml(format!(
        "<CompleteMultipartUploadResult><Location>{}</Location><Bucket>{}</Bucket><Key>{}</Key><ETag>{}</ETag></CompleteMultipartUploadResult>",
        location.replace('&', "&amp;"),
        bucket,
        key,
        etag
    ))
}

// =============================================================================
// Responses
// =============================================================================

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

fn xml_quoted_md5(data: &[u8]) -> String {
    format!("&quot;{:x}&quot;", md5::compute(data))
}

/// Text of every `<tag>...</tag>` in document order
fn tag_values(text: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(after[..end].to_string());
        rest = &after[end + close.len()..];
    }
    values
}

fn xml(body: String) -> Response<Bytes> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/xml")
        .body(Bytes::from(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", body)))
        .unwrap()
}

fn empty(status: u16) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .header("x-iijgio-request-id", "fake-request")
        .body(Bytes::new())
        .unwrap()
}

fn error(status: u16, code: &str) -> Response<Bytes> {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code><Message>{} from fake</Message><Resource></Resource><RequestId>fake-request</RequestId></Error>",
        code, code
    );
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/xml")
        .body(Bytes::from(body))
        .unwrap()
}
