use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{ProgressReporter, TransferJob, TransferRouter};
use crate::core::error::TransferError;
use crate::remote::{InlineUpload, Payload, RemoteObject};

/// Whole file in one request to the category endpoint. Bytes map straight
/// onto 0..=100.
pub(super) async fn run(
    router: &TransferRouter,
    job: &TransferJob,
    reporter: &Arc<ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<RemoteObject, TransferError> {
    let total = job.file.byte_size;
    reporter.phase(0, 100);

    router
        .call_sized("upload_inline", total, cancel, || {
            router.remote().upload_inline(
                InlineUpload {
                    file_name: job.file.name.clone(),
                    category: job.category,
                    payload: Payload::whole(&job.file),
                },
                reporter.counter(total),
            )
        })
        .await
}
