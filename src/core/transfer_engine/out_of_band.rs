use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ProgressReporter, TRANSFER_SHARE, TransferJob, TransferRouter};
use crate::core::error::TransferError;
use crate::remote::{ConfirmRequest, Payload, RemoteObject, UploadTarget, UploadTargetRequest};

/// A target this close to expiry is replaced before a retried PUT.
const EXPIRY_MARGIN_SECS: u64 = 5;

struct IssuedTarget {
    target: UploadTarget,
    issued_at: Instant,
}

impl IssuedTarget {
    fn new(target: UploadTarget) -> Self {
        Self {
            target,
            issued_at: Instant::now(),
        }
    }

    fn expired(&self) -> bool {
        self.issued_at.elapsed().as_secs() + EXPIRY_MARGIN_SECS >= self.target.expires_in
    }
}

/// Write target, direct PUT, then confirmation.
pub(super) async fn run(
    router: &TransferRouter,
    job: &TransferJob,
    reporter: &Arc<ProgressReporter>,
    cancel: &CancellationToken,
) -> Result<RemoteObject, TransferError> {
    let file = &job.file;
    let total = file.byte_size;
    let target_request = UploadTargetRequest {
        file_name: file.name.clone(),
        category: job.category,
        size: total,
        content_type: file.mime_type.clone(),
    };

    reporter.phase(0, TRANSFER_SHARE);

    let target = router
        .call("request_upload_target", cancel, || {
            router.remote().request_upload_target(&target_request)
        })
        .await?;
    debug!(object_id = %target.object_id, expires_in = target.expires_in, "Write target issued");

    let issued = Mutex::new(IssuedTarget::new(target));
    let put_timeout = router.config().timeout_for(total);

    router
        .config()
        .retry
        .run("put_to_target", cancel, |attempt| {
            let issued = &issued;
            let target_request = &target_request;
            async move {
                let (url, expired) = {
                    let current = issued.lock().unwrap_or_else(PoisonError::into_inner);
                    (current.target.upload_url.clone(), current.expired())
                };

                let url = if attempt > 1 && expired {
                    let fresh = router
                        .guarded(cancel, router.remote().request_upload_target(target_request))
                        .await?;
                    info!(object_id = %fresh.object_id, "Write target expired, requested a new one");
                    let url = fresh.upload_url.clone();
                    *issued.lock().unwrap_or_else(PoisonError::into_inner) = IssuedTarget::new(fresh);
                    url
                } else {
                    url
                };

                router
                    .guarded_within(
                        cancel,
                        put_timeout,
                        router
                            .remote()
                            .put_to_target(&url, Payload::whole(file), reporter.counter(total)),
                    )
                    .await
            }
        })
        .await?;

    reporter.finalizing();

    let object_id = issued
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .target
        .object_id;
    let confirm = ConfirmRequest {
        object_id,
        file_name: file.name.clone(),
        category: job.category,
        size: total,
    };

    router
        .call("confirm_upload", cancel, || router.remote().confirm_upload(&confirm))
        .await
}
