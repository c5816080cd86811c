use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ProgressReporter, TRANSFER_SHARE, TransferJob, TransferRouter};
use crate::core::error::TransferError;
use crate::remote::{
    AbortChunkedRequest, ByteCounter, ChunkedSession, ChunkedSessionRequest,
    CompleteChunkedRequest, CompletedChunk, Payload, RemoteObject,
};

/// Byte range of one chunk. `index` is 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

/// Split `size` bytes into consecutive chunks of `chunk_size`; only the last
/// one may be shorter.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    let chunk_size = chunk_size.max(1);
    let mut spans = Vec::with_capacity(size.div_ceil(chunk_size) as usize);
    let mut offset = 0;

    while offset < size {
        let len = chunk_size.min(size - offset);
        spans.push(ChunkSpan {
            index: spans.len(),
            offset,
            len,
        });
        offset += len;
    }
    spans
}

/// Resumable multi-part transfer: initiate, upload every chunk, complete.
///
/// Any failure after initiation aborts the session. On cancellation the
/// abort is sent in the background so the task can finish immediately.
pub(super) async fn run(
    router: &TransferRouter,
    job: &TransferJob,
    reporter: &Arc<ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<RemoteObject, TransferError> {
    let file = &job.file;
    let spans = plan_chunks(file.byte_size, router.config().chunk_size);
    let request = ChunkedSessionRequest {
        file_name: file.name.clone(),
        category: job.category,
        size: file.byte_size,
        content_type: file.mime_type.clone(),
        chunk_count: spans.len(),
    };

    reporter.phase(0, TRANSFER_SHARE);

    let session = router
        .call("initiate_chunked", cancel, || {
            router.remote().initiate_chunked(&request)
        })
        .await?;
    debug!(upload_id = %session.upload_id, chunks = spans.len(), "Chunked session opened");

    let abort = AbortChunkedRequest {
        upload_id: session.upload_id.clone(),
        key: session.key.clone(),
    };

    if session.part_urls.len() != spans.len() {
        abort_session(router, &abort).await;
        return Err(TransferError::Protocol(format!(
            "session has {} part targets for {} chunks",
            session.part_urls.len(),
            spans.len()
        )));
    }

    let parts = match upload_chunks(router, job, &session, &spans, reporter, cancel).await {
        Ok(parts) => parts,
        Err(err) => return Err(fail(router, abort, err).await),
    };

    reporter.finalizing();

    let complete = CompleteChunkedRequest {
        upload_id: session.upload_id.clone(),
        key: session.key.clone(),
        parts,
    };

    match router
        .call("complete_chunked", cancel, || {
            router.remote().complete_chunked(&complete)
        })
        .await
    {
        Ok(object) => Ok(object),
        Err(err) => Err(fail(router, abort, err).await),
    }
}

async fn upload_chunks(
    router: &TransferRouter,
    job: &TransferJob,
    session: &ChunkedSession,
    spans: &[ChunkSpan],
    reporter: &Arc<ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<Vec<CompletedChunk>, TransferError> {
    let total = job.file.byte_size;
    let sent = Arc::new(Mutex::new(vec![0u64; spans.len()]));
    let parallelism = router.config().chunk_parallelism.max(1);

    // Built up front from owned URLs so the stream holds plain futures.
    let chunk_uploads: Vec<_> = spans
        .iter()
        .zip(&session.part_urls)
        .map(|(span, url)| {
            let counter = chunk_counter(&sent, span.index, total, reporter);
            upload_chunk(router, job, *span, url.clone(), counter, cancel)
        })
        .collect();
    let mut uploads = stream::iter(chunk_uploads).buffer_unordered(parallelism);

    let mut completed = Vec::with_capacity(spans.len());
    while let Some(result) = uploads.next().await {
        // Returning early drops the chunks still in flight.
        completed.push(result?);
    }

    completed.sort_by_key(|chunk| chunk.index);
    Ok(completed)
}

async fn upload_chunk(
    router: &TransferRouter,
    job: &TransferJob,
    span: ChunkSpan,
    url: String,
    counter: ByteCounter,
    cancel: &CancellationToken,
) -> Result<CompletedChunk, TransferError> {
    let receipt = router
        .call_sized("upload_chunk", span.len, cancel, || {
            router.remote().put_to_target(
                &url,
                Payload::range(&job.file, span.offset, span.len),
                counter.clone(),
            )
        })
        .await?;

    let token = receipt.token.ok_or_else(|| {
        TransferError::Protocol(format!(
            "chunk {} was accepted without a completion token",
            span.index + 1
        ))
    })?;

    Ok(CompletedChunk {
        index: span.index,
        token,
    })
}

/// Counter for one chunk that reports the sum over all chunks.
fn chunk_counter(
    sent: &Arc<Mutex<Vec<u64>>>,
    index: usize,
    total: u64,
    reporter: &Arc<ProgressReporter>,
) -> ByteCounter {
    let sent = Arc::clone(sent);
    let reporter = Arc::clone(reporter);
    Arc::new(move |bytes| {
        let mut sent = sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent[index] = bytes;
        reporter.bytes(sent.iter().sum(), total);
    })
}

/// Abort the session and hand back the error that caused it.
async fn fail(router: &TransferRouter, abort: AbortChunkedRequest, err: TransferError) -> TransferError {
    if err == TransferError::Cancelled {
        let remote = Arc::clone(router.remote());
        let timeout = router.config().request_timeout;
        tokio::spawn(async move {
            if tokio::time::timeout(timeout, remote.abort_chunked(&abort)).await.is_err() {
                warn!(upload_id = %abort.upload_id, "Abort of cancelled session timed out");
            }
        });
    } else {
        abort_session(router, &abort).await;
    }
    err
}

async fn abort_session(router: &TransferRouter, abort: &AbortChunkedRequest) {
    let timeout = router.config().request_timeout;
    match tokio::time::timeout(timeout, router.remote().abort_chunked(abort)).await {
        Ok(Ok(())) => debug!(upload_id = %abort.upload_id, "Chunked session aborted"),
        Ok(Err(e)) => warn!(upload_id = %abort.upload_id, error = %e, "Failed to abort chunked session"),
        Err(_) => warn!(upload_id = %abort.upload_id, "Abort of chunked session timed out"),
    }
}
