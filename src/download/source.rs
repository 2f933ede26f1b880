//! Byte sources
//!
//! The transfer loop only needs "give me the bytes of `url` from `offset`".
//! [`HttpSource`] does that with a `Range` request; tests plug in their own.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;

use crate::config;
use crate::log_debug;

const MODULE: &str = "download";

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// No response within the connect timeout
    #[error("timed out: {0}")]
    Timeout(String),
    /// Connection refused, reset or dropped
    #[error("{0}")]
    Connection(String),
}

/// Response to a ranged fetch
pub struct SourceResponse {
    /// HTTP-style status: 200 full body, 206 partial, 416 range not satisfiable
    pub status: u16,
    /// Length of `body`, when announced
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, SourceError>>,
}

#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Fetch `url` starting at byte `offset`
    async fn fetch(&self, url: &str, offset: u64) -> Result<SourceResponse, SourceError>;
}

/// HTTP(S) source backed by reqwest
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config::app::USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

fn classify(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout(e.to_string())
    } else {
        SourceError::Connection(e.to_string())
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn fetch(&self, url: &str, offset: u64) -> Result<SourceResponse, SourceError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            log_debug!(MODULE, "Requesting {} from byte {}", url, offset);
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify))
            .boxed();

        Ok(SourceResponse {
            status,
            content_length,
            body,
        })
    }
}
