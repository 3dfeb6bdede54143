//! Core engine for the Scratchpad execution host.
//!
//! This crate provides:
//! - Process supervision and the host/worker RPC channel
//! - Lazily started, replaceable worker slots behind [`ExecutionHost`]
//! - The worker-side execution service and dump batching queue
//! - The built-in pad script runtime and reference resolver

pub mod batch;
pub mod channel;
pub mod config;
pub mod dump;
pub mod error;
pub mod host;
pub mod paths;
pub mod protocol;
pub mod resolver;
pub mod script;
pub mod slot;
pub mod supervisor;
pub mod worker;

pub use batch::{
    BatchConfig, BatchSink, DeliveryPolicy, DumpContext, DumpQueue, PumpStats, dump_queue,
};
pub use channel::{DumpSink, RpcClient};
pub use config::HostConfig;
pub use dump::{
    DiagnosticRecord, DumpEvent, DumpPayload, ErrorRecord, Location, RenderedValue, Severity,
};
pub use error::{Error, Result};
pub use host::ExecutionHost;
pub use resolver::{
    FsReferenceResolver, PreludeSource, ReferenceResolver, Resolution, ResolverConfig,
};
pub use script::{Compilation, CompileOptions, CompileService, CompiledUnit, PadCompiler};
pub use slot::ServiceSlot;
pub use supervisor::{
    ServiceHandle, StartupError, Supervisor, WorkerProcess, kill_tracked_workers,
    tracked_worker_count,
};
pub use worker::{WorkerService, serve};
