//! Retrying request executor
//!
//! Every attempt rebuilds the request from a factory, signs it when
//! credentials are configured, sends it and classifies the outcome:
//!
//! | Outcome                  | Action                              |
//! |--------------------------|-------------------------------------|
//! | status < 400             | stop                                |
//! | status == 404            | stop, never retried                 |
//! | other status >= 400      | retry, returned as-is on exhaustion |
//! | transport failure        | retry, last error on exhaustion     |
//!
//! Attempts are separated by a fixed interval. A final status >= 300 is
//! turned into a [`ServiceError`].
//!
//! [`RequestExecutor::execute_streaming`] applies the same rules but hands
//! a successful body back unread. Failed answers are still collected so
//! that they can be decoded.

use crate::s3::canonical::REQUEST_ID_HEADER;
use crate::s3::error::{Result, ServiceError, StorageError};
use crate::s3::signer::Signer;
use crate::s3::transport::{full_body, HttpTransport, RequestBody, ResponseBody};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed-count, fixed-interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `retries + 1` attempts at most
    pub retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            interval: Duration::from_millis(3000),
        }
    }
}

/// Error document returned by the service
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ErrorBody {
    code: String,
    message: String,
    resource: String,
    request_id: String,
}

/// Build the structured error of a failed response.
pub fn service_error(response: &Response<Bytes>) -> ServiceError {
    let status = response.status();
    let is_xml = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("xml"))
        .unwrap_or(false);

    if is_xml {
        match quick_xml::de::from_reader::<_, ErrorBody>(response.body().as_ref()) {
            Ok(body) => {
                return ServiceError {
                    status: status.as_u16(),
                    code: body.code,
                    message: body.message,
                    resource: body.resource,
                    request_id: body.request_id,
                }
            }
            Err(e) => debug!(error = %e, "Undecodable error body, using status line"),
        }
    }

    let request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();

    let mut message = String::from_utf8_lossy(response.body()).trim().to_string();
    if message.len() > 256 {
        let mut end = 256;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }

    ServiceError {
        status: status.as_u16(),
        code: status.canonical_reason().unwrap_or("Unknown").to_string(),
        message,
        resource: String::new(),
        request_id,
    }
}

fn should_stop(status: StatusCode) -> bool {
    status.as_u16() < 400 || status == StatusCode::NOT_FOUND
}

fn into_result(response: Response<Bytes>) -> Result<Response<Bytes>> {
    if response.status().as_u16() >= 300 {
        return Err(StorageError::Service(service_error(&response)));
    }
    Ok(response)
}

/// Final result of an attempt, or `None` when it should be retried.
fn settle(outcome: Result<Response<Bytes>>, attempt: u32, max_attempts: u32) -> Option<Result<Response<Bytes>>> {
    match outcome {
        Ok(response) => {
            let status = response.status();
            if should_stop(status) || attempt >= max_attempts {
                return Some(into_result(response));
            }
            warn!(attempt, max_attempts, status = status.as_u16(), "Request failed, retrying");
            None
        }
        Err(e) => {
            if attempt >= max_attempts {
                return Some(Err(e));
            }
            warn!(attempt, max_attempts, error = %e, "Request failed, retrying");
            None
        }
    }
}

async fn collect_response(response: Response<ResponseBody>) -> Result<Response<Bytes>> {
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, body))
}

/// Decode an XML response body.
pub fn decode_xml<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(quick_xml::de::from_reader(body)?)
}

/// Stateless request executor. Clone is cheap.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    signer: Signer,
    sign_requests: bool,
    policy: RetryPolicy,
    user_agent: String,
    log_headers: bool,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>, signer: Signer, policy: RetryPolicy) -> Self {
        let sign_requests = !signer.credentials().is_anonymous();
        Self {
            transport,
            signer,
            sign_requests,
            policy,
            user_agent: format!("stowage/{}", env!("CARGO_PKG_VERSION")),
            log_headers: false,
        }
    }

    /// Log every request and response header at debug level
    pub fn with_header_logging(mut self, enabled: bool) -> Self {
        self.log_headers = enabled;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// A copy of this executor that never signs.
    pub fn anonymous(&self) -> Self {
        let mut executor = self.clone();
        executor.sign_requests = false;
        executor
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run a request with retries.
    ///
    /// `factory` is called once per attempt and must produce the same
    /// request each time, body included.
    pub async fn execute<F, Fut>(&self, mut factory: F) -> Result<Response<Bytes>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Request<RequestBody>>>,
    {
        let max_attempts = self.policy.retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut request = factory().await?;
            self.prepare(&mut request)?;
            self.log_request(&request);

            let outcome = self.transport.send(request).await;
            if let Ok(response) = &outcome {
                self.log_response(response);
            }
            if let Some(result) = settle(outcome, attempt, max_attempts) {
                return result;
            }

            tokio::time::sleep(self.policy.interval).await;
        }
    }

    /// Run a request with retries, returning a successful body unread.
    pub async fn execute_streaming<F, Fut>(&self, mut factory: F) -> Result<Response<ResponseBody>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Request<RequestBody>>>,
    {
        let max_attempts = self.policy.retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut request = factory().await?;
            self.prepare(&mut request)?;
            self.log_request(&request);

            let outcome = match self.transport.send_streaming(request).await {
                Ok(response) => {
                    self.log_response(&response);
                    if response.status().as_u16() < 300 {
                        return Ok(response);
                    }
                    collect_response(response).await
                }
                Err(e) => Err(e),
            };
            if let Some(result) = settle(outcome, attempt, max_attempts) {
                return result.map(|response| response.map(full_body));
            }

            tokio::time::sleep(self.policy.interval).await;
        }
    }

    /// Run a request with retries and decode the XML body of the answer.
    pub async fn execute_xml<T, F, Fut>(&self, factory: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Request<RequestBody>>>,
    {
        let response = self.execute(factory).await?;
        decode_xml(response.body())
    }

    fn prepare(&self, request: &mut Request<RequestBody>) -> Result<()> {
        if !request.headers().contains_key(USER_AGENT) {
            let value = HeaderValue::from_str(&self.user_agent).map_err(hyper::http::Error::from)?;
            request.headers_mut().insert(USER_AGENT, value);
        }
        if self.sign_requests {
            self.signer.sign(request)?;
        }
        Ok(())
    }

    fn log_request(&self, request: &Request<RequestBody>) {
        debug!(">> {} {} {:?}", request.method(), request.uri(), request.version());
        if self.log_headers {
            log_header_map(">>", request.headers());
        }
    }

    fn log_response<B>(&self, response: &Response<B>) {
        debug!("<< {:?} {}", response.version(), response.status());
        if self.log_headers {
            log_header_map("<<", response.headers());
        }
    }
}

fn log_header_map(direction: &str, headers: &HeaderMap) {
    for (name, value) in headers {
        debug!("{} {}: {}", direction, name, String::from_utf8_lossy(value.as_bytes()));
    }
}
