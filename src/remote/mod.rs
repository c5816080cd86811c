//! The remote endpoints a transfer talks to.
//!
//! `RemoteStore` is the seam between the transfer strategies and the wire:
//! one method per endpoint, no retry, timeout or cancellation logic of its
//! own. The router wraps every call with those.
//!
//! - `http`: reqwest implementation against a base URL
//! - `simulated`: in-process store with configurable throughput

pub mod http;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::core::error::TransferError;
use crate::core::models::{ByteStream, Category, ContentHandle, FileRef};

pub use http::HttpRemote;
pub use simulated::SimulatedRemote;

/// Called with the cumulative number of body bytes handed to the transport.
pub type ByteCounter = Arc<dyn Fn(u64) + Send + Sync>;

/// A byte range of a file, to be sent as a request body.
#[derive(Debug, Clone)]
pub struct Payload {
    pub content: ContentHandle,
    pub offset: u64,
    pub len: u64,
    pub content_type: String,
}

impl Payload {
    pub fn whole(file: &FileRef) -> Self {
        Self::range(file, 0, file.byte_size)
    }

    pub fn range(file: &FileRef, offset: u64, len: u64) -> Self {
        Self {
            content: file.content.clone(),
            offset,
            len,
            content_type: file.mime_type.clone(),
        }
    }

    /// Open the range as a body stream that reports bytes as they are
    /// yielded.
    pub async fn stream(&self, progress: ByteCounter) -> Result<ByteStream, TransferError> {
        let inner = self.content.stream_range(self.offset, self.len).await?;
        let mut sent = 0u64;
        Ok(Box::pin(inner.map(move |piece| {
            if let Ok(bytes) = &piece {
                sent += bytes.len() as u64;
                progress(sent);
            }
            piece
        })))
    }
}

/// Whole-file upload to the category's endpoint.
#[derive(Debug, Clone)]
pub struct InlineUpload {
    pub file_name: String,
    pub category: Category,
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTargetRequest {
    pub file_name: String,
    pub category: Category,
    pub size: u64,
    pub content_type: String,
}

/// Short-lived write location for an out-of-band transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTarget {
    #[serde(alias = "url")]
    pub upload_url: String,
    #[serde(alias = "asset_id", alias = "id")]
    pub object_id: String,
    /// Seconds the target stays valid after it was issued.
    #[serde(default = "default_expiry")]
    pub expires_in: u64,
}

fn default_expiry() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub object_id: String,
    pub file_name: String,
    pub category: Category,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedSessionRequest {
    pub file_name: String,
    pub category: Category,
    pub size: u64,
    pub content_type: String,
    pub chunk_count: usize,
}

/// Multi-part session: one write target per chunk, in chunk order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedSession {
    pub upload_id: String,
    pub part_urls: Vec<String>,
    pub key: String,
}

/// Completion token for one uploaded chunk. `index` is 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChunk {
    pub index: usize,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct CompleteChunkedRequest {
    pub upload_id: String,
    pub key: String,
    /// Ordered by chunk index.
    pub parts: Vec<CompletedChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortChunkedRequest {
    pub upload_id: String,
    pub key: String,
}

/// What the direct-to-target PUT returned.
#[derive(Debug, Clone, Default)]
pub struct PutReceipt {
    /// Completion token (`ETag`), when the target sends one.
    pub token: Option<String>,
}

/// Object created by the remote once it has the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    #[serde(alias = "object_id", alias = "asset_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload_inline(
        &self,
        upload: InlineUpload,
        progress: ByteCounter,
    ) -> Result<RemoteObject, TransferError>;

    async fn request_upload_target(
        &self,
        request: &UploadTargetRequest,
    ) -> Result<UploadTarget, TransferError>;

    async fn put_to_target(
        &self,
        url: &str,
        payload: Payload,
        progress: ByteCounter,
    ) -> Result<PutReceipt, TransferError>;

    async fn confirm_upload(&self, request: &ConfirmRequest)
    -> Result<RemoteObject, TransferError>;

    async fn initiate_chunked(
        &self,
        request: &ChunkedSessionRequest,
    ) -> Result<ChunkedSession, TransferError>;

    async fn complete_chunked(
        &self,
        request: &CompleteChunkedRequest,
    ) -> Result<RemoteObject, TransferError>;

    async fn abort_chunked(&self, request: &AbortChunkedRequest) -> Result<(), TransferError>;
}
