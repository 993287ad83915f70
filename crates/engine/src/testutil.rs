//! A scripted engine adapter for exercising supervisors and wrappers
//! without embedding a real interpreter.

use std::collections::HashMap;
use std::rc::Rc;

use value::Value;

use crate::{default_log_sink, Callback, CallbackRegistry, Engine, Error, LogSink};

/// Context handed to a mock guest function while it runs.
pub struct MockCtx<'a> {
    callbacks: &'a CallbackRegistry,
    constants: &'a HashMap<String, Value>,
    sink: &'a LogSink,
}

impl MockCtx<'_> {
    /// Invokes a native callback the host registered, as guest code would.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        self.callbacks.invoke(name, args)
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    pub fn log(&self, message: &str) {
        (self.sink)(message);
    }
}

pub type MockFn = Rc<dyn Fn(&MockCtx, &[Value]) -> Result<Value, Error>>;

/// An [`Engine`] whose guest functions are Rust closures installed by the
/// test. Compiling stores the source verbatim; a source containing the
/// string `syntax error` fails to compile, which is enough to exercise
/// every caller-visible compile path.
pub struct MockEngine {
    functions: HashMap<String, MockFn>,
    callbacks: CallbackRegistry,
    constants: HashMap<String, Value>,
    compiled: Option<String>,
    sink: LogSink,
    refuse_initialize: bool,
    rejected_callbacks: Vec<String>,
}

impl MockEngine {
    pub fn new() -> MockEngine {
        MockEngine {
            functions: HashMap::new(),
            callbacks: CallbackRegistry::new(),
            constants: HashMap::new(),
            compiled: None,
            sink: default_log_sink(),
            refuse_initialize: false,
            rejected_callbacks: Vec::new(),
        }
    }

    pub fn with_function(
        mut self,
        name: &str,
        f: impl Fn(&MockCtx, &[Value]) -> Result<Value, Error> + 'static,
    ) -> MockEngine {
        self.functions.insert(name.to_string(), Rc::new(f));
        self
    }

    /// Makes `initialize` report failure, as an adapter with a broken
    /// runtime installation would.
    pub fn refuse_initialize(mut self) -> MockEngine {
        self.refuse_initialize = true;
        self
    }

    /// Makes `define_callback` fail for `name`, as an adapter would when
    /// a global of that name cannot be bound.
    pub fn reject_callback(mut self, name: &str) -> MockEngine {
        self.rejected_callbacks.push(name.to_string());
        self
    }

    pub fn compiled_source(&self) -> Option<&str> {
        self.compiled.as_deref()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        MockEngine::new()
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn initialize(&mut self, _memory_cap: u64) -> Result<(), Error> {
        if self.refuse_initialize {
            return Err(Error::Lockdown("mock adapter refused to initialize".to_string()));
        }
        Ok(())
    }

    fn compile_script(&mut self, source: &str) -> Result<(), Error> {
        if source.contains("syntax error") {
            return Err(Error::Compile("mock parser rejected the source".to_string()));
        }
        self.compiled = Some(source.to_string());
        Ok(())
    }

    fn is_function(&mut self, name: &str) -> Result<bool, Error> {
        Ok(self.functions.contains_key(name))
    }

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let f = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchFunction(name.to_string()))?;
        let ctx = MockCtx {
            callbacks: &self.callbacks,
            constants: &self.constants,
            sink: &self.sink,
        };
        f(&ctx, args)
    }

    fn define_constant(&mut self, name: &str, value: &Value) -> Result<(), Error> {
        self.constants.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn define_callback(&mut self, name: &str, callback: Callback) -> Result<(), Error> {
        if self.rejected_callbacks.iter().any(|r| r == name) {
            return Err(Error::Guest(format!("mock adapter cannot bind {name}")));
        }
        self.callbacks.register(name, callback)?;
        Ok(())
    }

    fn set_log_sink(&mut self, sink: LogSink) {
        self.sink = sink;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mock_engine_round_trip() {
        let mut engine = MockEngine::new()
            .with_function("double_it", |ctx, args| {
                ctx.log("doubling");
                let doubled = ctx.call("add2", &[args[0].clone(), args[0].clone()])?;
                Ok(doubled)
            });

        engine.initialize(1 << 20).unwrap();
        engine
            .define_callback(
                "add2",
                Callback::new("ii", "i", |args| {
                    let (Value::Int32(a), Value::Int32(b)) = (&args[0], &args[1]) else {
                        anyhow::bail!("bad arguments");
                    };
                    Ok(Value::Int32(a + b))
                })
                .unwrap(),
            )
            .unwrap();

        engine.compile_script("function double_it(x) {}").unwrap();
        assert!(engine.is_function("double_it").unwrap());
        assert!(!engine.is_function("nope").unwrap());

        let out = engine.call_function("double_it", &[Value::Int32(21)]).unwrap();
        assert_eq!(out, Value::Int32(42));
    }

    #[test]
    fn test_mock_compile_rejection() {
        let mut engine = MockEngine::new();
        assert!(matches!(
            engine.compile_script("a syntax error here"),
            Err(Error::Compile(_))
        ));
        assert!(engine.compiled_source().is_none());
    }
}
