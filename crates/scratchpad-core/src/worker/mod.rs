//! Worker side of the host/worker split.
//!
//! [`serve`] runs inside the `scratchpad-worker` process: it accepts the
//! host's connection and dispatches `Initialize` and `Execute` to a
//! [`WorkerService`], which compiles code, runs it on the dedicated script
//! thread and streams dumps back through the batching queue.

mod runner;
mod server;
mod service;

pub use server::serve;
pub use service::WorkerService;
