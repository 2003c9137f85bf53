//! HTTP remote implementation.
//!
//! [`HttpRemote`] maps [`RemoteStore`] and [`FeedSource`] calls onto the
//! sync API. The actual HTTP client is abstracted via [`HttpClient`] so the
//! engine does not depend on a particular HTTP library; the CLI plugs in
//! reqwest, tests plug in a scripted client.

use crate::config::SyncConfig;
use crate::credentials::CredentialProvider;
use crate::error::{SyncError, SyncResult};
use crate::transport::{
    CommitOutcome, DeleteOutcome, Download, DownloadBody, FeedSource, FeedStream, RemoteStore,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use threadsync_protocol::{
    range_header, ChunkAck, ChunkUpload, CommitRequest, CommitResponse, ContentRange,
    DeleteRequest, DeleteResponse, ErrorPayload, EventId, FeedMessage, ManifestPage, ProtocolError,
    SseDecoder, SseFrame, SyncCursor, PROTOCOL_VERSION,
};
use tracing::{debug, warn};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// PUT
    Put,
    /// POST
    Post,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Put => "PUT",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL including the query string.
    pub url: String,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Returns a header value (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A fully read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns a header value (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Body of a streaming response, read piece by piece.
#[async_trait]
pub trait ByteStream: Send {
    /// Returns the next piece, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, HttpFailure>;
}

/// A response whose body is still arriving.
pub struct StreamingResponse {
    /// Status code.
    pub status: u16,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: Box<dyn ByteStream>,
}

/// Failure below the HTTP status level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    /// The client gave up waiting.
    #[error("request timed out")]
    Timeout,
    /// Connection could not be made or broke.
    #[error("connection failed: {0}")]
    Connect(String),
}

impl From<HttpFailure> for SyncError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Timeout => SyncError::Timeout,
            HttpFailure::Connect(message) => SyncError::Network(message),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and reads the whole response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpFailure>;

    /// Sends a request and returns as soon as the headers arrive.
    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse, HttpFailure>;
}

/// Maps a non-success status to the error taxonomy.
pub fn error_for_status(status: u16, headers: &[(String, String)], body: &[u8]) -> SyncError {
    let payload = ErrorPayload::parse(body);
    let message = payload
        .as_ref()
        .map(|p| p.message.clone())
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(body);
            text.chars().take(200).collect()
        });

    match status {
        401 | 403 => SyncError::AuthenticationFailed(message),
        408 => SyncError::Timeout,
        429 => {
            let from_header = find_header(headers, "retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let from_body = payload
                .as_ref()
                .and_then(ErrorPayload::retry_after_ms)
                .map(Duration::from_millis);
            SyncError::RateLimited {
                retry_after: from_header.or(from_body),
            }
        }
        500..=599 => SyncError::Server {
            status,
            message,
            retryable: payload.and_then(|p| p.retryable).unwrap_or(true),
        },
        _ => SyncError::Client {
            status,
            code: payload
                .map(|p| p.code)
                .unwrap_or_else(|| format!("http_{status}")),
            message,
        },
    }
}

/// Error bodies are read up to this size.
const MAX_ERROR_BODY: usize = 64 * 1024;

/// Streaming download body; each piece must arrive within the idle timeout.
struct HttpDownloadBody {
    body: Box<dyn ByteStream>,
    idle_timeout: Duration,
}

#[async_trait]
impl DownloadBody for HttpDownloadBody {
    async fn next_piece(&mut self) -> SyncResult<Option<Vec<u8>>> {
        match tokio::time::timeout(self.idle_timeout, self.body.next_chunk()).await {
            Ok(piece) => Ok(piece?),
            Err(_) => Err(SyncError::Timeout),
        }
    }
}

/// [`RemoteStore`] and [`FeedSource`] over HTTP.
pub struct HttpRemote<C: HttpClient> {
    base_url: String,
    client: C,
    credentials: Arc<dyn CredentialProvider>,
    profile_id: String,
    timeout: Duration,
}

impl<C: HttpClient> HttpRemote<C> {
    /// Creates a remote for `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        client: C,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            credentials,
            profile_id: "default".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Creates a remote using the URL, profile and timeout of `config`.
    pub fn from_config(
        config: &SyncConfig,
        client: C,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self::new(&config.base_url, client, credentials)
            .with_profile(&config.profile_id)
            .with_timeout(config.request_timeout)
    }

    /// Sets the credential profile.
    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = profile_id.into();
        self
    }

    /// Sets the per-request timeout. Streamed bodies apply it to each piece
    /// rather than to the whole body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, thread_id: &str, tail: &str, query: &[(&str, &str)]) -> String {
        let mut url = format!(
            "{}/threads/{}/files{}",
            self.base_url,
            urlencoding::encode(thread_id),
            tail
        );
        for (i, (name, value)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    fn authorize(&self, request: HttpRequest) -> SyncResult<HttpRequest> {
        let tokens = self.credentials.load_tokens(&self.profile_id)?.ok_or_else(|| {
            SyncError::AuthenticationFailed(format!(
                "no access token for profile {}",
                self.profile_id
            ))
        })?;
        Ok(request
            .header("Authorization", format!("Bearer {}", tokens.access_token))
            .header("X-Protocol-Version", PROTOCOL_VERSION.to_string()))
    }

    async fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let request = self.authorize(request)?;
        debug!(method = request.method.as_str(), url = %request.url, "http request");
        match tokio::time::timeout(self.timeout, self.client.send(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// Sends a request and waits for the headers only.
    async fn open(&self, request: HttpRequest) -> SyncResult<StreamingResponse> {
        let request = self.authorize(request)?;
        debug!(method = request.method.as_str(), url = %request.url, "http stream");
        match tokio::time::timeout(self.timeout, self.client.open_stream(request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// Reads what arrives of an error body, for the error payload.
    async fn error_body(&self, body: &mut Box<dyn ByteStream>) -> Vec<u8> {
        let mut bytes = Vec::new();
        while bytes.len() < MAX_ERROR_BODY {
            match tokio::time::timeout(self.timeout, body.next_chunk()).await {
                Ok(Ok(Some(piece))) => bytes.extend_from_slice(&piece),
                _ => break,
            }
        }
        bytes
    }
}

#[async_trait]
impl<C: HttpClient> RemoteStore for HttpRemote<C> {
    async fn fetch_manifest(
        &self,
        thread_id: &str,
        cursor: Option<&SyncCursor>,
        limit: u32,
    ) -> SyncResult<ManifestPage> {
        let limit = limit.to_string();
        let mut query = vec![("limit", limit.as_str())];
        if let Some(cursor) = cursor {
            query.insert(0, ("cursor", cursor.as_str()));
        }
        let request = HttpRequest::new(HttpMethod::Get, self.url(thread_id, "/manifest", &query))
            .header("Accept", "application/json");

        let response = self.execute(request).await?;
        if !response.is_success() {
            return Err(error_for_status(
                response.status,
                &response.headers,
                &response.body,
            ));
        }
        Ok(ManifestPage::parse(&response.body)?)
    }

    async fn download(
        &self,
        thread_id: &str,
        path: &str,
        revision_id: Option<&str>,
        offset: u64,
    ) -> SyncResult<Download> {
        let mut query = vec![("path", path)];
        if let Some(revision_id) = revision_id {
            query.push(("revisionId", revision_id));
        }
        let mut request =
            HttpRequest::new(HttpMethod::Get, self.url(thread_id, "/content", &query));
        if offset > 0 {
            request = request.header("Range", range_header(offset));
        }

        let mut response = self.open(request).await?;
        let range = match response.status {
            206 => find_header(&response.headers, "content-range")
                .and_then(ContentRange::parse)
                .ok_or_else(|| {
                    ProtocolError::invalid_field(
                        "Content-Range",
                        "missing or malformed on a partial response",
                    )
                })?,
            // Range ignored; the body is the whole file.
            200 => ContentRange::whole(
                find_header(&response.headers, "content-length")
                    .and_then(|v| v.trim().parse().ok()),
            ),
            status => {
                let body = self.error_body(&mut response.body).await;
                return Err(error_for_status(status, &response.headers, &body));
            }
        };
        Ok(Download {
            range,
            body: Box::new(HttpDownloadBody {
                body: response.body,
                idle_timeout: self.timeout,
            }),
        })
    }

    async fn upload_chunk(&self, chunk: &ChunkUpload) -> SyncResult<ChunkAck> {
        let tail = format!(
            "/uploads/{}/chunks/{}",
            urlencoding::encode(&chunk.upload_id),
            chunk.chunk_index
        );
        let total = chunk.total_chunks.to_string();
        let url = self.url(
            &chunk.thread_id,
            &tail,
            &[("path", chunk.path.as_str()), ("totalChunks", total.as_str())],
        );
        let request = HttpRequest::new(HttpMethod::Put, url)
            .header("Content-Type", "application/octet-stream")
            .header("X-Chunk-Sha256", chunk.chunk_sha256.clone())
            .header("Idempotency-Key", chunk.idempotency_key())
            .body(chunk.bytes.clone());

        let response = self.execute(request).await?;
        if !response.is_success() {
            return Err(error_for_status(
                response.status,
                &response.headers,
                &response.body,
            ));
        }
        Ok(ChunkAck::parse(&response.body, chunk.chunk_index)?)
    }

    async fn commit(&self, request: &CommitRequest) -> SyncResult<CommitOutcome> {
        let tail = format!(
            "/uploads/{}/commit",
            urlencoding::encode(&request.upload_id)
        );
        let body = serde_json::to_vec(request)
            .map_err(|e| ProtocolError::malformed("commit request", e.to_string()))?;
        let http = HttpRequest::new(HttpMethod::Post, self.url(&request.thread_id, &tail, &[]))
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", request.idempotency_key())
            .body(body);

        let response = self.execute(http).await?;
        match response.status {
            409 | 412 => Ok(CommitOutcome::Conflict {
                current_revision_id: ErrorPayload::parse(&response.body)
                    .and_then(|p| p.current_revision_id()),
            }),
            status if (200..300).contains(&status) => {
                let parsed = CommitResponse::parse(&response.body)?;
                Ok(CommitOutcome::Committed {
                    revision_id: parsed.revision_id,
                })
            }
            status => Err(error_for_status(status, &response.headers, &response.body)),
        }
    }

    async fn delete(&self, request: &DeleteRequest) -> SyncResult<DeleteOutcome> {
        let url = self.url(&request.thread_id, "", &[("path", request.path.as_str())]);
        let mut http = HttpRequest::new(HttpMethod::Delete, url)
            .header("Idempotency-Key", request.idempotency_key.clone());
        if let Some(revision) = &request.if_match_revision_id {
            http = http.header("If-Match", revision.clone());
        }

        let response = self.execute(http).await?;
        match response.status {
            404 => Ok(DeleteOutcome::Deleted { revision_id: None }),
            409 | 412 => Ok(DeleteOutcome::Conflict {
                current_revision_id: ErrorPayload::parse(&response.body)
                    .and_then(|p| p.current_revision_id()),
            }),
            status if (200..300).contains(&status) => Ok(DeleteOutcome::Deleted {
                revision_id: DeleteResponse::parse(&response.body)?.revision_id,
            }),
            status => Err(error_for_status(status, &response.headers, &response.body)),
        }
    }
}

/// Change-feed stream decoded from a `text/event-stream` body.
pub struct SseFeedStream {
    body: Box<dyn ByteStream>,
    decoder: SseDecoder,
    frames: VecDeque<SseFrame>,
}

impl SseFeedStream {
    /// Wraps a streaming body.
    pub fn new(body: Box<dyn ByteStream>) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            frames: VecDeque::new(),
        }
    }
}

#[async_trait]
impl FeedStream for SseFeedStream {
    async fn next_message(&mut self) -> SyncResult<Option<FeedMessage>> {
        loop {
            while let Some(frame) = self.frames.pop_front() {
                match FeedMessage::from_frame(&frame) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => warn!(error = %e, "dropping invalid feed frame"),
                }
            }
            match self.body.next_chunk().await? {
                Some(bytes) => self.frames.extend(self.decoder.push(&bytes)),
                None => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl<C: HttpClient> FeedSource for HttpRemote<C> {
    async fn subscribe(
        &self,
        thread_id: &str,
        last_event_id: Option<&EventId>,
    ) -> SyncResult<Box<dyn FeedStream>> {
        let mut request = HttpRequest::new(HttpMethod::Get, self.url(thread_id, "/events", &[]))
            .header("Accept", "text/event-stream");
        if let Some(id) = last_event_id {
            request = request.header("Last-Event-ID", id.as_str());
        }
        let response = self.open(request).await?;
        match response.status {
            200 => Ok(Box::new(SseFeedStream::new(response.body))),
            410 => Err(SyncError::FeedGap),
            status => Err(error_for_status(status, &response.headers, &[])),
        }
    }
}
