pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod extract;
pub mod index;
pub mod lifecycle;
pub mod memory;
pub mod observe;
pub mod store;
pub mod verify;

#[cfg(feature = "aws")]
pub mod ecs_scheduler;
#[cfg(feature = "aws")]
pub mod opensearch;
#[cfg(feature = "aws")]
pub mod s3_store;
#[cfg(feature = "aws")]
pub mod telemetry;

pub use clock::{RecordingSleeper, SleeperLike, ThreadSleeper};
pub use config::{ReconcileConfig, RetryPolicy};
pub use driver::{InputDisposition, InvocationStatus, ReconcileOutcome, Reconciler, RunStatus, handle_invocation};
pub use error::*;
pub use extract::{IdentifierExtractor, extract};
pub use index::{IndexClientLike, IndexQuery, SearchHits};
pub use lifecycle::{SchedulerLike, WorkerLifecycle, WorkerState};
pub use observe::{ReconcileEvent, ReconcileObserver, RecordingObserver, TracingObserver};
pub use store::{ObjectStoreLike, PendingInput};
pub use verify::{MatchStrategy, MatchVerdict, MatchVerifier};

#[cfg(feature = "aws")]
pub use telemetry::init_tracing;
