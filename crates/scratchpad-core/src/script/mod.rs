//! The pad script language and the compilation seam used by the worker.
//!
//! Pad is a small statically-typed expression language. A submission is a
//! sequence of statements optionally ending in a bare expression; that
//! expression's value is the run's final result. Bindings declared by
//! reference preludes are visible to the submission.
//!
//! The worker only depends on [`CompileService`] and [`CompiledUnit`], so a
//! different language can be plugged in without touching the execution path.

mod check;
mod eval;
mod lexer;
mod parser;

use crate::batch::DumpContext;
use crate::dump::{DiagnosticRecord, ErrorRecord, Location, RenderedValue};
use crate::resolver::PreludeSource;

pub use eval::{ScriptError, Value};

/// Modules callable as `module.function(...)` once imported.
pub const MODULES: &[&str] = &["math", "text"];

/// Inputs to a compilation besides the source text.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Modules the code may call into.
    pub imports: Vec<String>,
    /// Sources compiled and run ahead of the submission.
    pub preludes: Vec<PreludeSource>,
}

/// Result of compiling a submission.
#[derive(Debug)]
pub struct Compilation<U> {
    /// Present only when no error-severity diagnostic was produced.
    pub unit: Option<U>,
    pub diagnostics: Vec<DiagnosticRecord>,
}

impl<U> Compilation<U> {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(DiagnosticRecord::is_error)
    }
}

/// Compiled code ready to run on the script thread.
pub trait CompiledUnit: Send + 'static {
    /// Run to completion. Dumps go to `ctx`; the return value is the final
    /// expression, if the code ends in one.
    fn run(&self, ctx: &DumpContext) -> Result<Option<RenderedValue>, ErrorRecord>;
}

/// Turns source text into a runnable unit plus diagnostics.
pub trait CompileService: Send + Sync + 'static {
    type Unit: CompiledUnit;

    fn compile(&self, source: &str, options: &CompileOptions) -> Compilation<Self::Unit>;
}

/// Compiler for pad scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct PadCompiler;

/// A checked pad program with its preludes.
#[derive(Debug)]
pub struct PadUnit {
    preludes: Vec<(String, parser::Program)>,
    program: parser::Program,
}

impl PadCompiler {
    pub fn new() -> Self {
        Self
    }

    fn parse(source: &str, name: Option<&str>) -> Result<parser::Program, DiagnosticRecord> {
        let located = |message: String, pos: lexer::Pos| {
            DiagnosticRecord::error(
                message,
                Some(Location {
                    source: name.map(str::to_string),
                    line: pos.line,
                    column: pos.column,
                }),
            )
        };
        let tokens = lexer::tokenize(source).map_err(|e| located(e.message, e.pos))?;
        parser::parse(tokens).map_err(|e| located(e.message, e.pos))
    }
}

impl CompileService for PadCompiler {
    type Unit = PadUnit;

    fn compile(&self, source: &str, options: &CompileOptions) -> Compilation<PadUnit> {
        let mut diagnostics = Vec::new();
        let mut checker = check::Checker::new(&options.imports);

        let mut preludes = Vec::with_capacity(options.preludes.len());
        for prelude in &options.preludes {
            match Self::parse(&prelude.text, Some(&prelude.name)) {
                Ok(program) => {
                    checker.check_program(&program, Some(&prelude.name));
                    preludes.push((prelude.name.clone(), program));
                }
                Err(diagnostic) => diagnostics.push(diagnostic),
            }
        }

        let program = match Self::parse(source, None) {
            Ok(program) => {
                checker.check_program(&program, None);
                Some(program)
            }
            Err(diagnostic) => {
                diagnostics.push(diagnostic);
                None
            }
        };
        diagnostics.extend(checker.finish());

        let failed = diagnostics.iter().any(DiagnosticRecord::is_error);
        let unit = match program {
            Some(program) if !failed => Some(PadUnit { preludes, program }),
            _ => None,
        };

        Compilation { unit, diagnostics }
    }
}

impl CompiledUnit for PadUnit {
    fn run(&self, ctx: &DumpContext) -> Result<Option<RenderedValue>, ErrorRecord> {
        let mut interpreter = eval::Interpreter::new(ctx);
        for (name, prelude) in &self.preludes {
            interpreter
                .run(prelude, Some(name))
                .map_err(ScriptError::into_record)?;
        }

        match interpreter.run(&self.program, None) {
            Ok(Value::Unit) => Ok(None),
            Ok(value) => Ok(Some(value.render())),
            Err(e) => Err(e.into_record()),
        }
    }
}
