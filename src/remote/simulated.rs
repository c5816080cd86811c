use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

use super::{
    AbortChunkedRequest, ByteCounter, ChunkedSession, ChunkedSessionRequest,
    CompleteChunkedRequest, ConfirmRequest, InlineUpload, Payload, PutReceipt, RemoteObject,
    RemoteStore, UploadTarget, UploadTargetRequest,
};
use crate::core::error::TransferError;

const MIB: u64 = 1024 * 1024;

/// Bytes consumed between throttling pauses.
const THROTTLE_STEP: u64 = MIB;

/// In-process remote store for dry runs.
///
/// Reads the real content (so unreadable files still fail) but sends it
/// nowhere, pacing itself at `speed_mb_per_sec` and adding a fixed latency
/// to every control-plane call.
pub struct SimulatedRemote {
    pub speed_mb_per_sec: u64,
    pub latency: Duration,
}

impl Default for SimulatedRemote {
    fn default() -> Self {
        Self {
            speed_mb_per_sec: 100,
            latency: Duration::from_millis(50),
        }
    }
}

impl SimulatedRemote {
    async fn drain(&self, payload: &Payload, progress: ByteCounter) -> Result<u64, TransferError> {
        let mut stream = payload.stream(progress).await?;
        let bytes_per_sec = (self.speed_mb_per_sec.max(1) * MIB) as f64;
        let mut consumed = 0u64;
        let mut since_pause = 0u64;

        while let Some(piece) = stream.next().await {
            let piece = piece?;
            consumed += piece.len() as u64;
            since_pause += piece.len() as u64;

            if since_pause >= THROTTLE_STEP {
                sleep(Duration::from_secs_f64(since_pause as f64 / bytes_per_sec)).await;
                since_pause = 0;
            }
        }

        if consumed != payload.len {
            return Err(TransferError::Content(format!(
                "expected {} bytes, content ended after {}",
                payload.len, consumed
            )));
        }
        Ok(consumed)
    }

    fn object(&self) -> RemoteObject {
        RemoteObject {
            id: Uuid::now_v7().to_string(),
            url: None,
        }
    }
}

#[async_trait]
impl RemoteStore for SimulatedRemote {
    async fn upload_inline(
        &self,
        upload: InlineUpload,
        progress: ByteCounter,
    ) -> Result<RemoteObject, TransferError> {
        let bytes = self.drain(&upload.payload, progress).await?;
        sleep(self.latency).await;
        debug!(file = %upload.file_name, bytes, "(Simulated) inline upload stored");
        Ok(self.object())
    }

    async fn request_upload_target(
        &self,
        request: &UploadTargetRequest,
    ) -> Result<UploadTarget, TransferError> {
        sleep(self.latency).await;
        let object_id = Uuid::now_v7().to_string();
        Ok(UploadTarget {
            upload_url: format!("sim://targets/{}/{}", object_id, request.file_name),
            object_id,
            expires_in: 900,
        })
    }

    async fn put_to_target(
        &self,
        url: &str,
        payload: Payload,
        progress: ByteCounter,
    ) -> Result<PutReceipt, TransferError> {
        let bytes = self.drain(&payload, progress).await?;
        debug!(url, bytes, "(Simulated) target received bytes");
        Ok(PutReceipt {
            token: Some(format!("\"{}\"", Uuid::now_v7().simple())),
        })
    }

    async fn confirm_upload(
        &self,
        request: &ConfirmRequest,
    ) -> Result<RemoteObject, TransferError> {
        sleep(self.latency).await;
        Ok(RemoteObject {
            id: request.object_id.clone(),
            url: None,
        })
    }

    async fn initiate_chunked(
        &self,
        request: &ChunkedSessionRequest,
    ) -> Result<ChunkedSession, TransferError> {
        sleep(self.latency).await;
        let upload_id = Uuid::now_v7().to_string();
        Ok(ChunkedSession {
            part_urls: (1..=request.chunk_count)
                .map(|n| format!("sim://multipart/{}/{}", upload_id, n))
                .collect(),
            key: format!("uploads/{}/{}", request.category, request.file_name),
            upload_id,
        })
    }

    async fn complete_chunked(
        &self,
        request: &CompleteChunkedRequest,
    ) -> Result<RemoteObject, TransferError> {
        sleep(self.latency).await;
        debug!(upload_id = %request.upload_id, parts = request.parts.len(), "(Simulated) session completed");
        Ok(self.object())
    }

    async fn abort_chunked(&self, request: &AbortChunkedRequest) -> Result<(), TransferError> {
        sleep(self.latency).await;
        debug!(upload_id = %request.upload_id, "(Simulated) session aborted");
        Ok(())
    }
}
