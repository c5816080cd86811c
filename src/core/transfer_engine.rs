//! Strategy selection and execution for a single task.
//!
//! ## Strategies
//!
//! - `inline`: one request carrying the whole file, for files under 10 MiB
//! - `out_of_band`: write target from the control plane, bytes straight to
//!   the target, then a confirmation call
//! - `chunked`: resumable multi-part session in 5 MiB chunks
//!
//! Every network call a strategy makes goes through [`TransferRouter::call`],
//! which applies the cancellation token, the per-call timeout and the shared
//! retry policy.

mod chunked;
mod inline;
mod out_of_band;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::error::TransferError;
use super::models::{Category, FileRef, TaskId};
use super::progress::{DEFAULT_SAMPLE_INTERVAL, ProgressMeter, scale_into};
use super::retry::RetryPolicy;
use super::validator::MIB;
use crate::remote::{ByteCounter, RemoteObject, RemoteStore};

pub use chunked::{ChunkSpan, plan_chunks};

/// Files below this go inline; at or above it, out of band.
pub const INLINE_LIMIT: u64 = 10 * MIB;

/// Part size for resumable chunked transfers. The last part may be shorter.
pub const CHUNK_SIZE: u64 = 5 * MIB;

/// Share of an out-of-band or chunked task's progress covered by the bytes.
/// The rest belongs to finalization and is only reached on completion.
const TRANSFER_SHARE: u8 = 90;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Slowest link a byte-moving call is expected to survive: 256 KiB/s.
pub const DEFAULT_MIN_THROUGHPUT: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Inline,
    OutOfBand,
    Chunked,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::Inline => "inline",
            StrategyKind::OutOfBand => "out_of_band",
            StrategyKind::Chunked => "chunked",
        })
    }
}

/// Pick the strategy for a file of `byte_size` bytes.
///
/// Chunked transfer is used only when asked for, either per file or by a
/// configured size threshold; otherwise the 10 MiB boundary decides.
pub fn select_strategy(
    byte_size: u64,
    prefer_resumable: bool,
    resumable_threshold: Option<u64>,
) -> StrategyKind {
    if prefer_resumable || resumable_threshold.is_some_and(|limit| byte_size >= limit) {
        StrategyKind::Chunked
    } else if byte_size < INLINE_LIMIT {
        StrategyKind::Inline
    } else {
        StrategyKind::OutOfBand
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Applied to every network call independently of cancellation. Calls
    /// that carry a body get extra time on top, see [`Self::timeout_for`].
    pub request_timeout: Duration,
    /// Bytes per second a body upload may fall to before it times out.
    /// Zero turns the size allowance off.
    pub min_throughput: u64,
    pub chunk_size: u64,
    /// Chunks in flight at once within one chunked transfer.
    pub chunk_parallelism: usize,
    pub resumable_threshold: Option<u64>,
    pub retry: RetryPolicy,
    /// Minimum interval between throughput samples.
    pub sample_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            min_throughput: DEFAULT_MIN_THROUGHPUT,
            chunk_size: CHUNK_SIZE,
            chunk_parallelism: 3,
            resumable_threshold: None,
            retry: RetryPolicy::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl RouterConfig {
    /// Timeout for a call sending `body_bytes` bytes: the base request
    /// timeout plus the time the body takes at `min_throughput`.
    pub fn timeout_for(&self, body_bytes: u64) -> Duration {
        if self.min_throughput == 0 {
            return self.request_timeout;
        }
        self.request_timeout + Duration::from_secs_f64(body_bytes as f64 / self.min_throughput as f64)
    }
}

/// Everything a strategy needs to move one file.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub task_id: TaskId,
    pub file: FileRef,
    pub category: Category,
    pub strategy: StrategyKind,
}

/// Progress as reported from inside a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Overall task percentage (already mapped into the phase window).
    Bytes {
        percent: u8,
        bytes_per_sec: Option<f64>,
        eta_secs: Option<u64>,
    },
    /// Bytes are in; the remote is being asked to register the object.
    Finalizing,
}

struct ReporterState {
    meter: ProgressMeter,
    window: (u8, u8),
    last_percent: Option<u8>,
}

/// Turns byte counts into [`ProgressEvent`]s for one task.
///
/// Updates that change neither the mapped percentage nor the throughput
/// sample are dropped.
pub struct ProgressReporter {
    emit: Box<dyn Fn(ProgressEvent) + Send + Sync>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(
        sample_interval: Duration,
        emit: impl Fn(ProgressEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            emit: Box::new(emit),
            state: Mutex::new(ReporterState {
                meter: ProgressMeter::new(sample_interval),
                window: (0, 100),
                last_percent: None,
            }),
        }
    }

    pub fn noop() -> Self {
        Self::new(DEFAULT_SAMPLE_INTERVAL, |_| {})
    }

    /// Map subsequent byte counts into `[lo, hi]` of the task's progress.
    pub fn phase(&self, lo: u8, hi: u8) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.window = (lo, hi.max(lo));
        state.meter.reset();
    }

    pub fn bytes(&self, loaded: u64, total: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = state.meter.observe(loaded, total, Instant::now());
        let (lo, hi) = state.window;
        let percent = scale_into(snapshot.percentage, lo, hi);

        if state.last_percent == Some(percent) && !snapshot.sampled {
            return;
        }
        state.last_percent = Some(percent);

        // Emitted under the lock so concurrent chunk callbacks stay ordered.
        (self.emit)(ProgressEvent::Bytes {
            percent,
            bytes_per_sec: snapshot.bytes_per_sec,
            eta_secs: snapshot.eta_secs,
        });
    }

    pub fn finalizing(&self) {
        (self.emit)(ProgressEvent::Finalizing);
    }

    /// Byte counter for a payload of `total` bytes.
    pub fn counter(self: &Arc<Self>, total: u64) -> ByteCounter {
        let reporter = Arc::clone(self);
        Arc::new(move |sent| reporter.bytes(sent, total))
    }
}

/// Executes transfer strategies against a [`RemoteStore`].
pub struct TransferRouter {
    remote: Arc<dyn RemoteStore>,
    config: RouterConfig,
}

impl TransferRouter {
    pub fn new(remote: Arc<dyn RemoteStore>, config: RouterConfig) -> Self {
        Self { remote, config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn strategy_for(&self, file: &FileRef) -> StrategyKind {
        select_strategy(
            file.byte_size,
            file.prefer_resumable,
            self.config.resumable_threshold,
        )
    }

    /// Run the job's strategy to completion, failure or cancellation.
    pub async fn execute(
        &self,
        job: &TransferJob,
        reporter: &Arc<ProgressReporter>,
        cancel: &CancellationToken,
    ) -> Result<RemoteObject, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        match job.strategy {
            StrategyKind::Inline => inline::run(self, job, reporter, cancel).await,
            StrategyKind::OutOfBand => out_of_band::run(self, job, reporter, cancel).await,
            StrategyKind::Chunked => chunked::run(self, job, reporter, cancel).await,
        }
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// One network call under the cancellation token and the per-call
    /// timeout. On cancellation the call's future is dropped, which aborts
    /// the request in flight.
    pub(crate) async fn guarded<T, Fut>(
        &self,
        cancel: &CancellationToken,
        call: Fut,
    ) -> Result<T, TransferError>
    where
        Fut: Future<Output = Result<T, TransferError>>,
    {
        self.guarded_within(cancel, self.config.request_timeout, call).await
    }

    pub(crate) async fn guarded_within<T, Fut>(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
        call: Fut,
    ) -> Result<T, TransferError>
    where
        Fut: Future<Output = Result<T, TransferError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = tokio::time::timeout(timeout, call) => match result {
                Ok(result) => result,
                Err(_) => Err(TransferError::Timeout { secs: timeout.as_secs() }),
            },
        }
    }

    /// [`guarded`](Self::guarded) plus the retry policy.
    pub(crate) async fn call<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        self.call_sized(operation, 0, cancel, op).await
    }

    /// [`call`](Self::call) for a request carrying `body_bytes` bytes, with
    /// the timeout stretched to match.
    pub(crate) async fn call_sized<T, F, Fut>(
        &self,
        operation: &str,
        body_bytes: u64,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let timeout = self.config.timeout_for(body_bytes);
        self.config
            .retry
            .run(operation, cancel, |_| self.guarded_within(cancel, timeout, op()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_boundary_decides_inline_or_out_of_band() {
        assert_eq!(select_strategy(1, false, None), StrategyKind::Inline);
        assert_eq!(select_strategy(INLINE_LIMIT - 1, false, None), StrategyKind::Inline);
        assert_eq!(select_strategy(INLINE_LIMIT, false, None), StrategyKind::OutOfBand);
        assert_eq!(select_strategy(50 * MIB, false, None), StrategyKind::OutOfBand);
    }

    #[test]
    fn chunked_only_when_requested() {
        assert_eq!(select_strategy(1, true, None), StrategyKind::Chunked);
        assert_eq!(
            select_strategy(200 * MIB, false, Some(100 * MIB)),
            StrategyKind::Chunked
        );
        assert_eq!(
            select_strategy(50 * MIB, false, Some(100 * MIB)),
            StrategyKind::OutOfBand
        );
    }

    #[test]
    fn reporter_maps_into_window_and_drops_repeats() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = ProgressReporter::new(Duration::from_secs(3600), move |e| {
            sink.lock().unwrap().push(e)
        });

        reporter.phase(0, 90);
        reporter.bytes(0, 100);
        reporter.bytes(0, 100);
        reporter.bytes(50, 100);
        reporter.bytes(100, 100);
        reporter.finalizing();

        let percents: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                ProgressEvent::Bytes { percent, .. } => Some(*percent),
                ProgressEvent::Finalizing => None,
            })
            .collect();
        assert_eq!(percents, vec![Some(0), Some(45), Some(90), None]);
    }

    #[test]
    fn body_timeout_grows_with_size() {
        let config = RouterConfig {
            request_timeout: Duration::from_secs(30),
            min_throughput: MIB,
            ..Default::default()
        };
        assert_eq!(config.timeout_for(0), Duration::from_secs(30));
        assert_eq!(config.timeout_for(500 * MIB), Duration::from_secs(530));

        let flat = RouterConfig {
            min_throughput: 0,
            ..config
        };
        assert_eq!(flat.timeout_for(500 * MIB), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn guarded_call_times_out() {
        let router = TransferRouter::new(
            Arc::new(crate::remote::SimulatedRemote::default()),
            RouterConfig {
                request_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let result: Result<(), _> = router
            .guarded(&CancellationToken::new(), std::future::pending())
            .await;
        assert_eq!(result, Err(TransferError::Timeout { secs: 0 }));
    }

    #[tokio::test]
    async fn guarded_call_observes_cancellation() {
        let router = TransferRouter::new(
            Arc::new(crate::remote::SimulatedRemote::default()),
            RouterConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = router.guarded(&cancel, std::future::pending()).await;
        assert_eq!(result, Err(TransferError::Cancelled));
    }
}
