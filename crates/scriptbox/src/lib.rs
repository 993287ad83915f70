//! Host-facing surface: pick an interpreter for a script, optionally wrap
//! it in the sandbox supervisor, bind constants and native callbacks, and
//! run guest entry points under a wall-clock budget.

use std::path::Path;
use std::time::{Duration, Instant};

pub use engine::{timeout, Callback, Engine, EngineKind, Error, LogSink};
pub use sandbox::{Sandbox, SandboxConfig, SandboxHandle};
pub use value::{Tag, Value};

/// Builds the in-process adapter for an engine kind. Only the JavaScript
/// adapter is linked into this build; the other kinds are selected and
/// reported so a host embedding additional adapters slots them in here.
fn new_adapter(kind: EngineKind) -> Result<Box<dyn Engine>, Error> {
    match kind {
        EngineKind::Javascript => Ok(Box::new(engine_js::JsEngine::new())),
        other => Err(Error::UnsupportedEngine(other)),
    }
}

enum Backend {
    Sandboxed(Sandbox),
    InProcess(Box<dyn Engine>),
}

/// An interpreter instance plus the caller-visible failure state: the
/// last error rendered as text, and whether the most recent failure was a
/// deadline (separating slow guests from broken ones).
pub struct Interpreter {
    backend: Backend,
    kind: EngineKind,
    last_error: Option<String>,
    timed_out: bool,
}

impl Interpreter {
    /// Selects the engine from the script path's extension and runs it
    /// behind a sandbox supervisor configured by `config`.
    pub fn by_extension(
        path: impl AsRef<Path>,
        config: &SandboxConfig,
    ) -> Result<Interpreter, Error> {
        let kind = EngineKind::from_path(path.as_ref());
        let inner = new_adapter(kind)?;
        let sandbox = Sandbox::spawn(inner, config)?;
        Ok(Interpreter {
            backend: Backend::Sandboxed(sandbox),
            kind,
            last_error: None,
            timed_out: false,
        })
    }

    /// Selects and initializes the engine in-process, with no isolation
    /// boundary. Appropriate only for trusted scripts.
    pub fn by_extension_unsandboxed(
        path: impl AsRef<Path>,
        config: &SandboxConfig,
    ) -> Result<Interpreter, Error> {
        let kind = EngineKind::from_path(path.as_ref());
        let mut inner = new_adapter(kind)?;
        inner.initialize(config.memory_cap)?;
        Ok(Interpreter {
            backend: Backend::InProcess(inner),
            kind,
            last_error: None,
            timed_out: false,
        })
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn is_sandboxed(&self) -> bool {
        matches!(self.backend, Backend::Sandboxed(_))
    }

    /// A weak supervisor handle, for host callbacks that need to consult
    /// the sandbox (and be refused when that would be re-entrant). `None`
    /// for in-process interpreters.
    pub fn sandbox_handle(&self) -> Option<SandboxHandle> {
        match &self.backend {
            Backend::Sandboxed(sandbox) => Some(sandbox.handle()),
            Backend::InProcess(_) => None,
        }
    }

    /// Text of the most recent failure, for display.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether the most recent failure was a deadline expiry.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn define_constant(&mut self, name: &str, value: &Value) -> Result<(), Error> {
        let result = self.engine_mut().define_constant(name, value);
        self.finish(result)
    }

    pub fn define_int_constant(&mut self, name: &str, value: i32) -> Result<(), Error> {
        self.define_constant(name, &Value::Int32(value))
    }

    pub fn define_string_constant(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.define_constant(name, &Value::String(value.to_string()))
    }

    /// Registers a native callback under `name`, with positional
    /// single-letter type descriptors for its parameters and return.
    pub fn define_function(
        &mut self,
        name: &str,
        params: &str,
        ret: &str,
        f: impl Fn(&[Value]) -> anyhow::Result<Value> + 'static,
    ) -> Result<(), Error> {
        let callback = match Callback::new(params, ret, f) {
            Ok(callback) => callback,
            Err(err) => return self.finish(Err(err)),
        };
        let result = self.engine_mut().define_callback(name, callback);
        self.finish(result)
    }

    pub fn compile_script(&mut self, source: &str) -> Result<(), Error> {
        let result = self.engine_mut().compile_script(source);
        self.finish(result)
    }

    pub fn is_function(&mut self, name: &str) -> Result<bool, Error> {
        let result = self.engine_mut().is_function(name);
        self.finish(result)
    }

    pub fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let result = self.engine_mut().call_function(name, args);
        self.finish(result)
    }

    /// Calls a guest function that must return an Int32, as exit-status
    /// style callers expect.
    pub fn call_int_function(&mut self, name: &str) -> Result<i32, Error> {
        match self.call_function(name, &[])? {
            Value::Int32(v) => Ok(v),
            other => self.finish(Err(Error::Convert(value::Error::NotConvertible {
                from: other.tag(),
                to: Tag::Int32,
            }))),
        }
    }

    /// Calls `function` under `budget`, without compiling anything first.
    pub fn call_function_with_timeout(
        &mut self,
        function: &str,
        args: &[Value],
        budget: Duration,
    ) -> Result<Value, Error> {
        self.compile_and_call_with_timeout(None, function, args, budget)
    }

    /// Compiles `script` (when given) and calls `function`, all under one
    /// wall-clock budget. A missing entry point is tolerated when a
    /// script was compiled alongside it; startup functions are optional.
    pub fn compile_and_call_with_timeout(
        &mut self,
        script: Option<&str>,
        function: &str,
        args: &[Value],
        budget: Duration,
    ) -> Result<Value, Error> {
        let (result, timed_out) = match &mut self.backend {
            Backend::Sandboxed(sandbox) => {
                run_sandboxed(sandbox, script, function, args, budget)
            }
            Backend::InProcess(inner) => {
                timeout::compile_and_call(inner.as_mut(), script, function, args, budget)
            }
        };
        let result = self.finish(result);
        self.timed_out = timed_out;
        if timed_out {
            self.last_error = Some(Error::Timeout.to_string());
        }
        result
    }

    fn engine_mut(&mut self) -> &mut dyn Engine {
        match &mut self.backend {
            Backend::Sandboxed(sandbox) => sandbox,
            Backend::InProcess(inner) => inner.as_mut(),
        }
    }

    fn finish<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        match &result {
            Ok(_) => self.timed_out = false,
            Err(err) => {
                self.timed_out = matches!(err, Error::Timeout)
                    || matches!(&self.backend, Backend::Sandboxed(s) if s.timed_out());
                self.last_error = Some(err.to_string());
                tracing::debug!(error = %err, "interpreter operation failed");
            }
        }
        result
    }
}

/// The supervisor enforces deadlines per command; spread one budget over
/// the compile and call by shrinking the per-call deadline as wall time
/// elapses, restoring the configured deadline afterwards.
fn run_sandboxed(
    sandbox: &mut Sandbox,
    script: Option<&str>,
    function: &str,
    args: &[Value],
    budget: Duration,
) -> (Result<Value, Error>, bool) {
    let prior = sandbox.call_deadline();
    let started = Instant::now();

    let step = |sandbox: &Sandbox| {
        let remaining = budget.saturating_sub(started.elapsed());
        sandbox.set_call_deadline(remaining);
        remaining.is_zero()
    };

    let result = (|| {
        if step(sandbox) {
            return Err(Error::Timeout);
        }
        if let Some(script) = script {
            sandbox.compile_script(script)?;
        }
        if step(sandbox) {
            return Err(Error::Timeout);
        }
        if sandbox.is_function(function)? {
            if step(sandbox) {
                return Err(Error::Timeout);
            }
            sandbox.call_function(function, args)
        } else if script.is_some() {
            Ok(Value::Void)
        } else {
            Err(Error::NoSuchFunction(function.to_string()))
        }
    })();

    sandbox.set_call_deadline(prior);

    let timed_out = matches!(result, Err(Error::Timeout)) || sandbox.timed_out();
    let result = match result {
        Err(_) if timed_out => Err(Error::Timeout),
        other => other,
    };
    (result, timed_out)
}
