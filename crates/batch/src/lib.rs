pub mod config;
pub mod job;
pub mod probe;
pub mod progress;
pub mod validate;
pub mod engine;
pub mod toolchain;
pub mod adapter;
pub mod scan;
pub mod orchestrator;

pub use adapter::{FfmpegEngine, MediaEngine, RunRequest, RunSummary};
pub use config::BatchConfig;
pub use job::{
    BatchAggregate, JobDescriptor, JobId, JobKind, JobOutcome, JobRecord, JobStatus,
    ProgressSample,
};
pub use orchestrator::{EnqueueReport, EventStream, Orchestrator, QueueEvent, QueueHandle};
pub use probe::{probe_media, MediaMetadata, ProbeError};
pub use toolchain::{inspect_toolchain, ToolchainStatus};
