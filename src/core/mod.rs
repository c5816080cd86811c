pub mod auth;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod transfer_engine;
pub mod validator;

pub use auth::{AuthFailure, AuthObserver, Credentials};
pub use error::{QueueError, RejectCode, Rejection, TransferError};
pub use models::{Category, ContentHandle, FileRef, TaskFailure, TaskId, TaskOutcome, TaskStatus, TaskView};
pub use orchestrator::{Orchestrator, SubmitReport};
pub use progress::{ProgressMeter, ProgressSnapshot};
pub use retry::RetryPolicy;
pub use scheduler::{QueueConfig, TaskEvent};
pub use transfer_engine::{RouterConfig, StrategyKind, TransferRouter, select_strategy};
