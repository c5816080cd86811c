#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use shuttle::core::transfer_engine::RouterConfig;
use shuttle::core::{
    FileRef, Orchestrator, QueueConfig, RetryPolicy, TaskEvent, TransferError, TransferRouter,
};
use shuttle::remote::{
    AbortChunkedRequest, ByteCounter, ChunkedSession, ChunkedSessionRequest,
    CompleteChunkedRequest, ConfirmRequest, InlineUpload, Payload, PutReceipt, RemoteObject,
    RemoteStore, UploadTarget, UploadTargetRequest,
};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{Semaphore, broadcast};

pub const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Inline(String),
    RequestTarget(String),
    Put { url: String, offset: u64, len: u64 },
    Confirm(String),
    Initiate { file: String, chunks: usize },
    Complete(Vec<(usize, String)>),
    Abort(String),
}

/// Remote store double. Records every call, can hold calls at a gate,
/// fail them on demand and delay individual chunks.
pub struct MockRemote {
    calls: Mutex<Vec<Call>>,
    gates: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
    failures: Mutex<HashMap<&'static str, VecDeque<TransferError>>>,
    part_delays: Mutex<HashMap<usize, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    dropped: AtomicUsize,
    ids: AtomicU64,
    /// Lifetime given to write targets, in seconds.
    pub target_expiry: AtomicU64,
    /// Serve this many part URLs instead of one per chunk.
    pub part_count_override: Mutex<Option<usize>>,
    /// Pause inside every byte-moving call.
    pub byte_call_delay: Mutex<Duration>,
}

struct InFlight<'a> {
    remote: &'a MockRemote,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn enter(remote: &'a MockRemote) -> Self {
        let now = remote.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        remote.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self {
            remote,
            finished: false,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.remote.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.finished {
            self.remote.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            part_delays: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            ids: AtomicU64::new(0),
            target_expiry: AtomicU64::new(900),
            part_count_override: Mutex::new(None),
            byte_call_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Hold every call of `operation` until a permit is added.
    pub fn gate(&self, operation: &'static str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().unwrap().insert(operation, gate.clone());
        gate
    }

    /// Fail the next call of `operation`. Byte-moving calls fail after
    /// their body has been sent.
    pub fn fail_next(&self, operation: &'static str, err: TransferError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    pub fn delay_part(&self, index: usize, delay: Duration) {
        self.part_delays.lock().unwrap().insert(index, delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Byte-moving calls whose future was dropped before finishing.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn scripted_failure(&self, operation: &'static str) -> Result<(), TransferError> {
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn pass_gate(&self, operation: &'static str) {
        let gate = self.gates.lock().unwrap().get(operation).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    async fn drain(&self, payload: &Payload, progress: ByteCounter) -> Result<(), TransferError> {
        let mut stream = payload.stream(progress).await?;
        while let Some(piece) = stream.next().await {
            piece?;
        }
        let delay = *self.byte_call_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn upload_inline(
        &self,
        upload: InlineUpload,
        progress: ByteCounter,
    ) -> Result<RemoteObject, TransferError> {
        self.record(Call::Inline(upload.file_name.clone()));
        let mut guard = InFlight::enter(self);

        self.drain(&upload.payload, progress).await?;
        self.pass_gate("upload_inline").await;
        guard.finished = true;
        self.scripted_failure("upload_inline")?;

        Ok(RemoteObject {
            id: format!("inline-{}", self.next_id()),
            url: None,
        })
    }

    async fn request_upload_target(
        &self,
        request: &UploadTargetRequest,
    ) -> Result<UploadTarget, TransferError> {
        self.record(Call::RequestTarget(request.file_name.clone()));
        self.scripted_failure("request_upload_target")?;
        self.pass_gate("request_upload_target").await;

        let n = self.next_id();
        Ok(UploadTarget {
            upload_url: format!("mock://target/{n}"),
            object_id: format!("obj-{n}"),
            expires_in: self.target_expiry.load(Ordering::SeqCst),
        })
    }

    async fn put_to_target(
        &self,
        url: &str,
        payload: Payload,
        progress: ByteCounter,
    ) -> Result<PutReceipt, TransferError> {
        self.record(Call::Put {
            url: url.to_string(),
            offset: payload.offset,
            len: payload.len,
        });
        let mut guard = InFlight::enter(self);

        let part = url
            .strip_prefix("mock://part/")
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(delay) = part.and_then(|n| self.part_delays.lock().unwrap().get(&n).copied()) {
            tokio::time::sleep(delay).await;
        }

        self.drain(&payload, progress).await?;
        self.pass_gate("put_to_target").await;
        guard.finished = true;
        self.scripted_failure("put_to_target")?;

        Ok(PutReceipt {
            token: Some(match part {
                Some(n) => format!("etag-{n}"),
                None => format!("etag-{}", self.next_id()),
            }),
        })
    }

    async fn confirm_upload(
        &self,
        request: &ConfirmRequest,
    ) -> Result<RemoteObject, TransferError> {
        self.record(Call::Confirm(request.object_id.clone()));
        self.pass_gate("confirm_upload").await;
        self.scripted_failure("confirm_upload")?;

        Ok(RemoteObject {
            id: request.object_id.clone(),
            url: None,
        })
    }

    async fn initiate_chunked(
        &self,
        request: &ChunkedSessionRequest,
    ) -> Result<ChunkedSession, TransferError> {
        self.record(Call::Initiate {
            file: request.file_name.clone(),
            chunks: request.chunk_count,
        });
        self.scripted_failure("initiate_chunked")?;

        let parts = self
            .part_count_override
            .lock()
            .unwrap()
            .unwrap_or(request.chunk_count);
        Ok(ChunkedSession {
            upload_id: format!("session-{}", self.next_id()),
            part_urls: (0..parts).map(|i| format!("mock://part/{i}")).collect(),
            key: format!("uploads/{}", request.file_name),
        })
    }

    async fn complete_chunked(
        &self,
        request: &CompleteChunkedRequest,
    ) -> Result<RemoteObject, TransferError> {
        self.record(Call::Complete(
            request
                .parts
                .iter()
                .map(|part| (part.index, part.token.clone()))
                .collect(),
        ));
        self.scripted_failure("complete_chunked")?;

        Ok(RemoteObject {
            id: format!("chunked-{}", request.upload_id),
            url: None,
        })
    }

    async fn abort_chunked(&self, request: &AbortChunkedRequest) -> Result<(), TransferError> {
        self.record(Call::Abort(request.upload_id.clone()));
        Ok(())
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.0,
        ..Default::default()
    }
}

pub fn router_config() -> RouterConfig {
    RouterConfig {
        request_timeout: Duration::from_secs(5),
        retry: fast_retry(),
        sample_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn orchestrator(remote: &Arc<MockRemote>, concurrency: usize) -> Orchestrator {
    orchestrator_with(remote, router_config(), QueueConfig {
        concurrency,
        ..Default::default()
    })
}

pub fn orchestrator_with(
    remote: &Arc<MockRemote>,
    router: RouterConfig,
    queue: QueueConfig,
) -> Orchestrator {
    let remote: Arc<dyn RemoteStore> = remote.clone();
    Orchestrator::new(TransferRouter::new(remote, router), queue, None)
}

pub fn text_file(name: &str, size: usize) -> FileRef {
    FileRef::from_bytes(name, "text/plain", vec![b'x'; size])
}

pub fn video_file(name: &str, size: usize) -> FileRef {
    FileRef::from_bytes(name, "video/mp4", vec![0u8; size])
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Everything currently buffered on an event receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
