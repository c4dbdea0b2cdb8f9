//! In-process safe-mode runner
//!
//! Evaluates JavaScript in an embedded QuickJS runtime when no container
//! runtime is available. Each run gets a fresh runtime with a memory ceiling,
//! a stack limit and an interrupt handler that enforces the wall clock. The
//! global object exposes only ECMAScript intrinsics plus console/print and
//! stdin helpers: no module loader, filesystem, network or process access.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rquickjs::prelude::{Coerced, Rest};
use rquickjs::{CatchResultExt, Context, Ctx, Function, Object, Runtime};
use tracing::{debug, warn};

use super::{PathLayout, RunLimits, RunOutcome, RunStatus, Runner, RunnableUnit};
use crate::core::{EngineError, IsolationLevel};
use crate::sandbox::BoundedBuffer;

const MAX_STACK_BYTES: usize = 512 * 1024;
/// Extra time the outer timer allows before giving up on the interpreter
const OUTER_GRACE: Duration = Duration::from_millis(500);

/// Removes dynamic code evaluation before user code runs
const HARDENING_PRELUDE: &str = r#"
(function () {
  'use strict';
  var blocked = function Function() {
    throw new EvalError('Dynamic code evaluation is disabled');
  };
  var protos = [
    Object.getPrototypeOf(function () {}),
    Object.getPrototypeOf(function* () {}),
    Object.getPrototypeOf(async function () {}),
    Object.getPrototypeOf(async function* () {}),
  ];
  blocked.prototype = protos[0];
  protos.forEach(function (proto) {
    Object.defineProperty(proto, 'constructor', {
      value: blocked, writable: false, configurable: false,
    });
  });
  Object.defineProperty(globalThis, 'Function', {
    value: blocked, writable: false, configurable: false,
  });
  delete globalThis.eval;
})();
"#;

/// Runner that evaluates JavaScript inside the engine process
#[derive(Debug, Default)]
pub struct SafeModeRunner;

impl SafeModeRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for SafeModeRunner {
    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::InProcess
    }

    fn layout(&self) -> PathLayout {
        PathLayout::InProcess
    }

    async fn run(
        &self,
        unit: &RunnableUnit,
        limits: &RunLimits,
        stdin: Option<&str>,
    ) -> Result<RunOutcome, EngineError> {
        let source = unit.source.clone();
        let input = stdin.unwrap_or_default().to_owned();
        let script_limits = limits.clone();
        let budget = Duration::from_millis(u64::from(limits.time_ms)) + OUTER_GRACE;

        let task = tokio::task::spawn_blocking(move || run_script(&source, &input, &script_limits));

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(EngineError::Interpreter(format!("interpreter thread failed: {}", e))),
            Err(_) => {
                // the interrupt handler should already have fired; the thread
                // is abandoned and finishes on its own
                warn!("Interpreter did not stop at its deadline for {}", unit.execution_id);
                Ok(RunOutcome {
                    status: RunStatus::TimeLimitExceeded,
                    runtime_ms: u64::from(limits.time_ms),
                    memory_kb: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    truncated: false,
                })
            }
        }
    }
}

fn interpreter_error(e: rquickjs::Error) -> EngineError {
    EngineError::Interpreter(e.to_string())
}

/// Evaluate `source` on the current thread
fn run_script(source: &str, stdin: &str, limits: &RunLimits) -> Result<RunOutcome, EngineError> {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(u64::from(limits.time_ms));
    let interrupted = Arc::new(AtomicBool::new(false));

    let runtime = Runtime::new().map_err(interpreter_error)?;
    runtime.set_memory_limit(limits.memory_mb as usize * 1024 * 1024);
    runtime.set_max_stack_size(MAX_STACK_BYTES);
    {
        let interrupted = interrupted.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            if Instant::now() >= deadline {
                interrupted.store(true, Ordering::Relaxed);
                true
            } else {
                false
            }
        })));
    }

    let context = Context::full(&runtime).map_err(interpreter_error)?;
    let stdout = Rc::new(RefCell::new(BoundedBuffer::new(limits.max_output_bytes)));
    let stderr = Rc::new(RefCell::new(BoundedBuffer::new(limits.max_output_bytes)));

    let failure = context.with(|ctx| -> Result<Option<String>, EngineError> {
        install_globals(&ctx, &stdout, &stderr, stdin).map_err(interpreter_error)?;
        ctx.eval::<(), _>(HARDENING_PRELUDE)
            .map_err(interpreter_error)?;

        match ctx.eval::<(), _>(source).catch(&ctx) {
            Ok(()) => Ok(None),
            Err(e) => Ok(Some(e.to_string())),
        }
    })?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let memory_kb = (runtime.memory_usage().memory_used_size.max(0) as u64) / 1024;

    let status = if interrupted.load(Ordering::Relaxed) {
        RunStatus::TimeLimitExceeded
    } else {
        match failure {
            None => RunStatus::Exited(0),
            Some(message) if is_out_of_memory(&message) => RunStatus::MemoryLimitExceeded,
            Some(message) => {
                debug!("Script threw: {}", message);
                stderr.borrow_mut().push_str(&format!("Uncaught {}\n", message));
                RunStatus::Exited(1)
            }
        }
    };
    let runtime_ms = match status {
        RunStatus::TimeLimitExceeded => u64::from(limits.time_ms),
        _ => elapsed_ms,
    };

    // the JS heap still holds clones of the buffers; swap them out instead of unwrapping
    let stdout = stdout.replace(BoundedBuffer::new(0)).finish();
    let stderr = stderr.replace(BoundedBuffer::new(0)).finish();

    Ok(RunOutcome {
        status,
        runtime_ms,
        memory_kb,
        truncated: stdout.truncated || stderr.truncated,
        stdout: stdout.text,
        stderr: stderr.text,
    })
}

fn is_out_of_memory(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("out of memory") || message.contains("allocation failed")
}

fn install_globals<'js>(
    ctx: &Ctx<'js>,
    stdout: &Rc<RefCell<BoundedBuffer>>,
    stderr: &Rc<RefCell<BoundedBuffer>>,
    stdin: &str,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let console = Object::new(ctx.clone())?;
    console.set("log", line_writer(ctx, stdout.clone())?)?;
    console.set("info", line_writer(ctx, stdout.clone())?)?;
    console.set("error", line_writer(ctx, stderr.clone())?)?;
    console.set("warn", line_writer(ctx, stderr.clone())?)?;
    globals.set("console", console)?;
    globals.set("print", line_writer(ctx, stdout.clone())?)?;

    let lines: Rc<RefCell<VecDeque<String>>> =
        Rc::new(RefCell::new(stdin.lines().map(str::to_owned).collect()));
    globals.set(
        "readline",
        Function::new(ctx.clone(), move || lines.borrow_mut().pop_front())?,
    )?;
    globals.set("input", stdin.to_owned())?;

    Ok(())
}

/// `console.log`-style function: arguments joined by spaces, newline terminated
fn line_writer<'js>(ctx: &Ctx<'js>, sink: Rc<RefCell<BoundedBuffer>>) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
        let line = args
            .0
            .iter()
            .map(|arg| arg.0.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let mut sink = sink.borrow_mut();
        sink.push_str(&line);
        sink.push_str("\n");
    })
}
