//! Stream resolution.
//!
//! Each content source knows how to turn its own resource identifiers into
//! fetchable URLs. The transfer only depends on the [`StreamResolver`]
//! contract; scraping or API calls stay inside the implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// What the transfer knows about the resource before resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQuery {
    /// Source name (e.g. a plugin or service id).
    pub service: String,
    /// Resource identifier within the service.
    pub resource_id: String,
    /// Preferred stream, if the caller picked one.
    pub stream_id: String,
    /// Raw stream URL hint, if any.
    pub stream_url: String,
}

/// A fetchable stream for a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCandidate {
    /// URL to fetch.
    pub url: String,
    /// Size in bytes, if the source knows it.
    pub size: Option<u64>,
    /// File name the source suggests.
    pub suggested_file_name: Option<String>,
    /// File extension of the stream (without the dot).
    pub file_extension: Option<String>,
}

impl StreamCandidate {
    /// Candidate with only a URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the size.
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the suggested file name.
    #[must_use]
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.suggested_file_name = Some(name.into());
        self
    }

    /// Set the file extension.
    #[must_use]
    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.file_extension = Some(ext.into());
        self
    }
}

/// Turns a resource identifier into candidate stream URLs, best first.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamResolver: Send + Sync {
    /// List the streams available for `query`.
    ///
    /// An empty list is treated by the caller as a resolution failure.
    async fn list_streams(
        &self,
        query: &StreamQuery,
    ) -> std::result::Result<Vec<StreamCandidate>, TransferError>;
}

/// Resolver for sources whose stream URL is already known.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectUrlResolver;

#[async_trait]
impl StreamResolver for DirectUrlResolver {
    async fn list_streams(
        &self,
        query: &StreamQuery,
    ) -> std::result::Result<Vec<StreamCandidate>, TransferError> {
        let url = query.stream_url.trim();
        if url.is_empty() {
            return Err(TransferError::Resolution(format!(
                "No stream URL for resource '{}'",
                query.resource_id
            )));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TransferError::Resolution(format!(
                "Unsupported stream URL: {url}"
            )));
        }

        let mut candidate = StreamCandidate::new(url);
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if let Some(name) = path.rsplit('/').next().filter(|n| !n.is_empty()) {
            if let Some((_, ext)) = name.rsplit_once('.')
                && !ext.is_empty()
                && ext.len() <= 5
            {
                candidate = candidate.with_extension(ext.to_ascii_lowercase());
            }
            candidate = candidate.with_file_name(name);
        }
        Ok(vec![candidate])
    }
}
