//! Worker-side execution service.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::batch::{BatchConfig, BatchSink, PumpStats, dump_queue};
use crate::dump::{DiagnosticRecord, DumpEvent};
use crate::error::Result;
use crate::protocol::InitializeParams;
use crate::resolver::ReferenceResolver;
use crate::script::{CompileOptions, CompileService};

use super::runner::ScriptThread;

/// Compile context set by `Initialize`.
#[derive(Default)]
struct CompileContext {
    options: CompileOptions,
    /// Resolver diagnostics not yet shown to the user.
    pending: Vec<DiagnosticRecord>,
}

/// Compiles and runs code for the worker's single connection.
pub struct WorkerService<C: CompileService> {
    compiler: C,
    resolver: Box<dyn ReferenceResolver>,
    context: Mutex<CompileContext>,
    runner: ScriptThread<C::Unit>,
    batch: BatchConfig,
}

impl<C: CompileService> WorkerService<C> {
    pub fn new(
        compiler: C,
        resolver: impl ReferenceResolver + 'static,
        batch: BatchConfig,
    ) -> Result<Self> {
        Ok(Self {
            compiler,
            resolver: Box::new(resolver),
            context: Mutex::new(CompileContext::default()),
            runner: ScriptThread::spawn()?,
            batch,
        })
    }

    /// Resolve references and store the compile context. A later call
    /// replaces the earlier one.
    pub fn initialize(&self, params: InitializeParams) {
        let resolution = self.resolver.resolve(
            &params.references,
            Path::new(&params.working_directory),
            &params.resolver,
        );
        tracing::info!(
            "Initialized with {} prelude(s), imports [{}]",
            resolution.preludes.len(),
            params.imports.join(", ")
        );

        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = CompileContext {
            options: CompileOptions {
                imports: params.imports,
                preludes: resolution.preludes,
            },
            pending: resolution.diagnostics,
        };
    }

    /// Compile and run `code`, streaming its output to `sink`.
    ///
    /// Compile errors and script exceptions are reported as dump events, not
    /// as errors. Returns after every event of this call has been flushed.
    pub async fn execute<S: BatchSink>(&self, code: &str, sink: &S) -> Result<PumpStats> {
        let (ctx, queue) = dump_queue();

        let compilation = {
            let mut context = self.context.lock().unwrap_or_else(PoisonError::into_inner);
            for diagnostic in context.pending.drain(..) {
                ctx.emit(DumpEvent::diagnostic(diagnostic));
            }
            self.compiler.compile(code, &context.options)
        };
        for diagnostic in compilation.diagnostics {
            ctx.emit(DumpEvent::diagnostic(diagnostic));
        }

        let Some(unit) = compilation.unit else {
            drop(ctx);
            return Ok(queue.pump(sink, &self.batch).await);
        };

        let (ran, stats) = tokio::join!(
            self.runner.run(unit, ctx),
            queue.pump(sink, &self.batch)
        );
        ran?;
        Ok(stats)
    }
}
