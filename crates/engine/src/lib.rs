use std::fmt;
use std::path::Path;
use std::rc::Rc;

use value::{adapt_args, adapt_return, Signature, Value};

mod registry;
pub mod timeout;
pub use registry::CallbackRegistry;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(String),
    #[error("no such function: {0}")]
    NoSuchFunction(String),
    #[error(transparent)]
    Convert(#[from] value::Error),
    #[error("callback {name} failed: {source:#}")]
    Callback {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("calling unknown callback function: {0}")]
    UnknownCallback(String),
    #[error("function {0} already defined")]
    DuplicateCallback(String),
    #[error("guest error: {0}")]
    Guest(String),
    #[error("unsupported guest value: {0}")]
    UnsupportedValue(&'static str),
    #[error(transparent)]
    Wire(#[from] wire::Error),
    #[error("wall-clock deadline exceeded")]
    Timeout,
    #[error("re-entrant invocation not supported: the guest is still waiting on one of your callbacks")]
    Reentrant,
    #[error("the sandbox child is gone")]
    ChildDied,
    #[error("sandbox lockdown failed: {0}")]
    Lockdown(String),
    #[error("guest ran out of memory")]
    OutOfMemory,
    #[error("no {0} engine is linked into this build")]
    UnsupportedEngine(EngineKind),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The scripting language an interpreter should embed, selected from the
/// script's file extension. Unrecognized extensions fall back to
/// JavaScript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Javascript,
    Lua,
    Python,
    Ruby,
}

impl EngineKind {
    pub fn from_path(path: &Path) -> EngineKind {
        match path.extension().and_then(|e| e.to_str()) {
            Some("lua") => EngineKind::Lua,
            Some("py") => EngineKind::Python,
            Some("rb") => EngineKind::Ruby,
            _ => EngineKind::Javascript,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Javascript => "javascript",
            EngineKind::Lua => "lua",
            EngineKind::Python => "python",
            EngineKind::Ruby => "ruby",
        })
    }
}

/// Sink for guest-visible log output. Engines route script `trace` output
/// and their own diagnostics here; inside a sandbox child the sink is
/// replaced with one that frames messages back to the parent.
pub type LogSink = Rc<dyn Fn(&str)>;

/// A sink that re-emits guest output through `tracing`.
pub fn default_log_sink() -> LogSink {
    Rc::new(|message| tracing::info!(target: "guest", "{}", message))
}

/// The host side of a registered native callback.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> anyhow::Result<Value>>;

enum Adapt {
    /// Arguments and return value are coerced through a declared signature.
    Declared(Signature),
    /// Arguments are forwarded untouched; adaptation happens at the other
    /// end of a process boundary. Used by sandbox proxy functions.
    Passthrough { arity: u8 },
}

/// A host-provided function, invocable by guest code.
///
/// The callable itself is never exposed to the guest: engines hand out a
/// [`value::FunctionHandle`] and dispatch through a [`CallbackRegistry`].
#[derive(Clone)]
pub struct Callback {
    adapt: Rc<Adapt>,
    f: NativeFn,
}

impl Callback {
    /// Builds a callback from descriptor strings, e.g. `("ii", "i")` for
    /// an (i32, i32) -> i32 function.
    pub fn new(
        params: &str,
        ret: &str,
        f: impl Fn(&[Value]) -> anyhow::Result<Value> + 'static,
    ) -> Result<Callback, Error> {
        let signature = Signature::parse(params, ret)?;
        Ok(Callback {
            adapt: Rc::new(Adapt::Declared(signature)),
            f: Rc::new(f),
        })
    }

    /// Builds a forwarding callback of known arity and no declared types.
    pub fn passthrough(
        arity: u8,
        f: impl Fn(&[Value]) -> anyhow::Result<Value> + 'static,
    ) -> Callback {
        Callback {
            adapt: Rc::new(Adapt::Passthrough { arity }),
            f: Rc::new(f),
        }
    }

    pub fn arity(&self) -> u8 {
        match &*self.adapt {
            Adapt::Declared(signature) => signature.arity(),
            Adapt::Passthrough { arity } => *arity,
        }
    }

    /// Invokes the callback, adapting arguments and the returned value
    /// through the declared signature. `name` is only used in errors.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        match &*self.adapt {
            Adapt::Declared(signature) => {
                let args = adapt_args(args, signature)?;
                let ret = (self.f)(&args).map_err(|source| Error::Callback {
                    name: name.to_string(),
                    source,
                })?;
                Ok(adapt_return(ret, signature)?)
            }
            Adapt::Passthrough { .. } => (self.f)(args).map_err(|source| Error::Callback {
                name: name.to_string(),
                source,
            }),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("arity", &self.arity()).finish()
    }
}

/// The uniform contract every interpreter satisfies, whether it embeds an
/// engine in-process or proxies one running in a sandbox child.
///
/// `initialize` runs before any guest code is loaded and is the only
/// point at which an adapter may touch the filesystem or load dynamic
/// state: inside a sandbox the syscall filter drops immediately after it
/// returns. Engine-side state is released on drop.
pub trait Engine {
    fn name(&self) -> &'static str;

    /// Prepares the engine, with `memory_cap` as an advisory heap bound.
    /// May be a no-op for adapters that have nothing to preload.
    fn initialize(&mut self, memory_cap: u64) -> Result<(), Error>;

    fn compile_script(&mut self, source: &str) -> Result<(), Error>;

    /// True iff `name` resolves to a callable global in the guest.
    fn is_function(&mut self, name: &str) -> Result<bool, Error>;

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, Error>;

    /// Binds a named global to a copy of the value's contents.
    fn define_constant(&mut self, name: &str, value: &Value) -> Result<(), Error>;

    /// Binds a native-callable global of the callback's arity.
    fn define_callback(&mut self, name: &str, callback: Callback) -> Result<(), Error>;

    fn set_log_sink(&mut self, sink: LogSink);
}
