//! reqwest-backed [`HttpClient`].

use crate::error::{CliError, CliResult};
use async_trait::async_trait;
use std::time::Duration;
use threadsync_engine::{
    ByteStream, HttpClient, HttpFailure, HttpMethod, HttpRequest, HttpResponse, StreamingResponse,
};

/// HTTP transport over a pooled `reqwest::Client`.
///
/// No overall request timeout is set here: the engine bounds each call
/// itself, and the change feed stays open indefinitely.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Builds a client with rustls and connection pooling.
    pub fn new(connect_timeout: Duration) -> CliResult<Self> {
        let inner = reqwest::ClientBuilder::new()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .use_rustls_tls()
            .user_agent(concat!("threadsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CliError::HttpClient(e.to_string()))?;
        Ok(Self { inner })
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<reqwest::Response, HttpFailure> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.inner.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }
        builder.send().await.map_err(failure)
    }
}

fn failure(error: reqwest::Error) -> HttpFailure {
    if error.is_timeout() {
        HttpFailure::Timeout
    } else {
        HttpFailure::Connect(error.to_string())
    }
}

fn headers_of(response: &reqwest::Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpFailure> {
        let response = self.dispatch(request).await?;
        let status = response.status().as_u16();
        let headers = headers_of(&response);
        let body = response.bytes().await.map_err(failure)?;
        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamingResponse, HttpFailure> {
        let response = self.dispatch(request).await?;
        Ok(StreamingResponse {
            status: response.status().as_u16(),
            headers: headers_of(&response),
            body: Box::new(ResponseBody(response)),
        })
    }
}

struct ResponseBody(reqwest::Response);

#[async_trait]
impl ByteStream for ResponseBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, HttpFailure> {
        let chunk = self.0.chunk().await.map_err(failure)?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}
