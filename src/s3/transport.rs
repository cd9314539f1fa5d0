//! HTTP transport
//!
//! The executor only needs `send(request) -> response`. Keeping that seam
//! behind a trait lets the whole protocol stack run against an in-memory
//! service in tests.
//!
//! Request bodies are either in memory or a section of a local file. File
//! sections are opened fresh for every attempt and streamed in bounded
//! reads, so a part never has to fit in memory.
//!
//! The hyper implementation is tuned the same way for every deployment:
//! - HTTP/1.1 only
//! - pooled idle connections (90s timeout)
//! - TCP_NODELAY
//! - native-tls, optionally without certificate verification
//! - optional HTTP proxy through a CONNECT tunnel

use crate::s3::error::{Result, StorageError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Largest single read from a file section
const READ_BUFFER_SIZE: u64 = 256 * 1024;

/// Response body handed out unread by [`HttpTransport::send_streaming`]
pub type ResponseBody = UnsyncBoxBody<Bytes, StorageError>;

type OutgoingBody = UnsyncBoxBody<Bytes, io::Error>;

/// Wrap collected bytes as a [`ResponseBody`].
pub fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

/// Running MD5 of the bytes a body has produced.
///
/// Clones share the same state, so the sender of a request can read the
/// digest after the transport consumed the body.
#[derive(Clone)]
pub struct BodyDigest {
    state: Arc<Mutex<(md5::Context, u64)>>,
}

impl BodyDigest {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new((md5::Context::new(), 0))),
        }
    }

    fn update(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0.consume(data);
        state.1 += data.len() as u64;
    }

    /// Bytes digested so far
    pub fn len(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Quoted lower-case hex MD5 of everything digested so far
    pub fn quoted_hex(&self) -> String {
        let context = self.state.lock().unwrap_or_else(PoisonError::into_inner).0.clone();
        format!("\"{:x}\"", context.compute())
    }
}

impl Default for BodyDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BodyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyDigest").field("len", &self.len()).finish()
    }
}

/// `length` bytes of a local file starting at `offset`
#[derive(Debug, Clone)]
pub struct FileSection {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
    digest: Option<BodyDigest>,
}

impl FileSection {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
            digest: None,
        }
    }

    /// Feed every byte read from the section into `digest`.
    pub fn with_digest(mut self, digest: BodyDigest) -> Self {
        self.digest = Some(digest);
        self
    }

    fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        stream::try_unfold((self, None::<tokio::fs::File>, 0u64), |(section, file, sent)| async move {
            if sent >= section.length {
                return Ok::<_, io::Error>(None);
            }

            let mut file = match file {
                Some(file) => file,
                None => {
                    let mut file = tokio::fs::File::open(&section.path).await?;
                    file.seek(SeekFrom::Start(section.offset)).await?;
                    file
                }
            };

            let want = READ_BUFFER_SIZE.min(section.length - sent);
            let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE as usize);
            let read = (&mut file).take(want).read_buf(&mut buf).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} ends before byte {}",
                        section.path.display(),
                        section.offset + section.length
                    ),
                ));
            }
            if let Some(digest) = &section.digest {
                digest.update(&buf);
            }
            Ok(Some((buf.freeze(), (section, Some(file), sent + read as u64))))
        })
        .boxed()
    }
}

/// Body of an outgoing request
#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes(Bytes),
    File(FileSection),
}

impl RequestBody {
    pub fn empty() -> Self {
        RequestBody::Bytes(Bytes::new())
    }

    /// Byte count the body will produce
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Bytes(bytes) => bytes.len() as u64,
            RequestBody::File(section) => section.length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the body in bounded chunks.
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            RequestBody::Bytes(bytes) if bytes.is_empty() => stream::empty().boxed(),
            RequestBody::Bytes(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            RequestBody::File(section) => section.into_stream(),
        }
    }

    /// Read the whole body into memory.
    pub async fn into_bytes(self) -> Result<Bytes> {
        if let RequestBody::Bytes(bytes) = self {
            return Ok(bytes);
        }
        let mut stream = self.into_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    fn into_outgoing(self) -> OutgoingBody {
        match self {
            RequestBody::Bytes(bytes) => Full::new(bytes).map_err(|never| match never {}).boxed_unsync(),
            body => StreamBody::new(body.into_stream().map_ok(Frame::data)).boxed_unsync(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<FileSection> for RequestBody {
    fn from(section: FileSection) -> Self {
        RequestBody::File(section)
    }
}

/// Narrow send capability used by the request executor.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request and collect the whole response body.
    ///
    /// Only failures without any response (connect, DNS, TLS, reset) are
    /// errors here; every HTTP status is a successful send.
    async fn send(&self, request: Request<RequestBody>) -> Result<Response<Bytes>>;

    /// Send one request and return the response body unread.
    async fn send_streaming(&self, request: Request<RequestBody>) -> Result<Response<ResponseBody>> {
        let response = self.send(request).await?;
        Ok(response.map(full_body))
    }
}

/// Connection settings for [`HyperTransport`]
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// HTTP proxy URL, e.g. `http://proxy.local:3128`
    pub proxy: Option<String>,
    /// Accept invalid certificates and host names
    pub insecure_skip_verify: bool,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            insecure_skip_verify: false,
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

type DirectClient = HyperClient<HttpsConnector<HttpConnector>, OutgoingBody>;
type TunneledClient = HyperClient<HttpsConnector<Tunnel<HttpConnector>>, OutgoingBody>;

#[derive(Clone)]
enum Connection {
    Direct(DirectClient),
    Tunneled(TunneledClient),
}

/// hyper based transport. Clone is cheap and shares the connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    connection: Connection,
}

impl HyperTransport {
    pub fn new(options: &TransportOptions) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(options.connect_timeout));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if options.insecure_skip_verify {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| StorageError::Transport(format!("failed to build TLS connector: {}", e)))?;

        let mut builder = HyperClient::builder(TokioExecutor::new());
        builder
            .pool_idle_timeout(options.pool_idle_timeout)
            .pool_max_idle_per_host(64)
            .set_host(true);

        let connection = match options.proxy.as_deref().filter(|p| !p.is_empty()) {
            Some(proxy) => {
                let proxy_uri: Uri = proxy.parse().map_err(|e| {
                    StorageError::InvalidArgument(format!("invalid proxy URL {:?}: {}", proxy, e))
                })?;
                tracing::debug!(proxy = %proxy_uri, "Routing requests through proxy tunnel");
                let tunnel = Tunnel::new(proxy_uri, http);
                Connection::Tunneled(builder.build(HttpsConnector::from((tunnel, tls.into()))))
            }
            None => Connection::Direct(builder.build(HttpsConnector::from((http, tls.into())))),
        };

        Ok(Self { connection })
    }
}

/// Render an error with its source chain; hyper's top-level messages are terse.
fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn send(&self, request: Request<RequestBody>) -> Result<Response<Bytes>> {
        let (parts, body) = self.send_streaming(request).await?.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Response::from_parts(parts, body))
    }

    async fn send_streaming(&self, request: Request<RequestBody>) -> Result<Response<ResponseBody>> {
        let request = request.map(RequestBody::into_outgoing);
        let response = match &self.connection {
            Connection::Direct(client) => client.request(request).await,
            Connection::Tunneled(client) => client.request(request).await,
        }
        .map_err(|e| StorageError::Transport(describe(&e)))?;

        Ok(response.map(|body| {
            body.map_err(|e| StorageError::Transport(describe(&e)))
                .boxed_unsync()
        }))
    }
}
