//! Upstream client: conditional fetches against a remote registry

pub mod http;

pub use http::HttpUpstream;

use crate::error::DepotResult;
use crate::store::model::Validators;
use crate::store::BlobReader;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io::{self, Read};

/// Unread response body.
///
/// Content is copied from the remote as it is consumed; only callers that
/// need the whole payload in memory (metadata transforms) buffer it.
pub struct UpstreamBody {
    reader: BlobReader,
}

impl UpstreamBody {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::from_reader(io::Cursor::new(bytes.into()))
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    pub fn into_reader(self) -> BlobReader {
        self.reader
    }

    /// Read the whole body on the blocking pool
    pub async fn read_all(self) -> io::Result<Bytes> {
        let mut reader = self.reader;
        tokio::task::spawn_blocking(move || {
            let mut buffer = Vec::new();
            reader.read_to_end(&mut buffer)?;
            Ok(Bytes::from(buffer))
        })
        .await
        .map_err(io::Error::other)?
    }
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamBody").finish_non_exhaustive()
    }
}

/// What a remote answered for one path
#[derive(Debug)]
pub enum UpstreamResponse {
    /// Full payload with the validators to use next time
    Fetched {
        body: UpstreamBody,
        validators: Validators,
        content_type: Option<String>,
    },
    /// Conditional request matched; the cached copy is still current
    NotModified { validators: Validators },
    /// The remote confirmed the path does not exist
    NotFound,
}

/// How an HTTP status maps onto [`UpstreamResponse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    NotModified,
    NotFound,
    /// Transport-level failure: auth walls, proxies, server errors
    Unavailable,
}

/// Classify an upstream status code.
///
/// Authentication and payment walls (401, 402, 407) say nothing about
/// whether the path exists, so they count as the remote being unavailable
/// rather than as a confirmed absence.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Ok,
        304 => StatusClass::NotModified,
        401 | 402 | 407 => StatusClass::Unavailable,
        400..=499 => StatusClass::NotFound,
        _ => StatusClass::Unavailable,
    }
}

/// A remote package source
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch `path` relative to the remote base URL, conditionally when
    /// `validators` are given.
    ///
    /// Transport failures and timeouts are `UpstreamUnavailable`.
    async fn fetch(
        &self,
        path: &str,
        validators: Option<&Validators>,
    ) -> DepotResult<UpstreamResponse>;

    /// Remote base URL, for logs and errors
    fn remote_url(&self) -> &str;
}
