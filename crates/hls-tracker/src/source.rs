// Byte source seam plus the built-in reqwest-backed implementation. The
// tracker only ever asks for "the bytes at this URI, gzip allowed, with
// these headers"; everything transport-specific stays behind this trait.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT_ENCODING, HeaderMap, HeaderValue};
use url::Url;

use crate::config::HttpSourceConfig;
use crate::error::{TrackerError, TrackerResult};

/// One playlist request.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub uri: Url,
    /// Per-request headers, merged over the source's defaults.
    pub headers: HeaderMap,
    /// Whether a compressed response is acceptable.
    pub allow_gzip: bool,
}

/// Loads playlist bytes. Implementations must be safe to call concurrently;
/// the tracker enforces single-flight per playlist URL above this seam.
#[async_trait]
pub trait PlaylistDataSource: Send + Sync {
    async fn load(&self, request: &LoadRequest) -> TrackerResult<Bytes>;
}

/// Default source backed by a shared [`reqwest::Client`].
pub struct HttpPlaylistSource {
    client: reqwest::Client,
}

impl HttpPlaylistSource {
    pub fn new(config: HttpSourceConfig) -> TrackerResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .default_headers(config.headers)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(TrackerError::network)?;
        Ok(Self { client })
    }

    /// Wraps an existing client, e.g. one shared with segment downloads.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaylistDataSource for HttpPlaylistSource {
    async fn load(&self, request: &LoadRequest) -> TrackerResult<Bytes> {
        let mut builder = self
            .client
            .get(request.uri.clone())
            .headers(request.headers.clone());
        if !request.allow_gzip {
            // The client negotiates gzip by default; opt this request out.
            builder = builder.header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }
        let response = builder.send().await.map_err(TrackerError::network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus {
                status,
                url: request.uri.to_string(),
            });
        }
        response.bytes().await.map_err(TrackerError::network)
    }
}
