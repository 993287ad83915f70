//! JavaScript engine adapter over `boa_engine`, and the default engine
//! for scripts whose extension matches nothing else.

use std::cell::RefCell;
use std::rc::Rc;

use boa_engine::property::Attribute;
use boa_engine::{Context, JsNativeError, JsString, JsValue, NativeFunction, Source};

use engine::{default_log_sink, Callback, CallbackRegistry, Engine, Error, LogSink};
use value::Value;

mod convert;
use convert::{js_to_value, value_to_js};

/// An in-process JavaScript interpreter.
///
/// The boa context is created inside `initialize`, not in `new`: a
/// sandboxed instance is constructed in the parent and forked, and only
/// the child — still pre-lockdown at that point — should pay for and own
/// the actual engine.
pub struct JsEngine {
    context: Option<Context<'static>>,
    callbacks: Rc<RefCell<CallbackRegistry>>,
    sink: Rc<RefCell<LogSink>>,
}

impl JsEngine {
    pub fn new() -> JsEngine {
        JsEngine {
            context: None,
            callbacks: Rc::new(RefCell::new(CallbackRegistry::new())),
            sink: Rc::new(RefCell::new(default_log_sink())),
        }
    }

    fn context(&mut self) -> &mut Context<'static> {
        self.context.get_or_insert_with(Context::default)
    }

    fn log(&self, message: &str) {
        let sink = self.sink.borrow().clone();
        sink(message);
    }
}

impl Default for JsEngine {
    fn default() -> Self {
        JsEngine::new()
    }
}

impl Engine for JsEngine {
    fn name(&self) -> &'static str {
        "javascript"
    }

    /// boa allocates from the ordinary process heap and exposes no heap
    /// ceiling of its own; the cap is enforced externally (RLIMIT_DATA in
    /// a sandbox child). Creating the context here still matters: it is
    /// the last point where the adapter may load anything.
    fn initialize(&mut self, memory_cap: u64) -> Result<(), Error> {
        tracing::debug!(memory_cap, "initializing javascript engine");
        self.context();
        Ok(())
    }

    fn compile_script(&mut self, source: &str) -> Result<(), Error> {
        // Evaluating the top level is what installs the script's global
        // function declarations.
        match self.context().eval(Source::from_bytes(source)) {
            Ok(_) => Ok(()),
            Err(err) => {
                let message = format!("script failed to compile: {err}");
                self.log(&message);
                Err(Error::Compile(err.to_string()))
            }
        }
    }

    fn is_function(&mut self, name: &str) -> Result<bool, Error> {
        let context = self.context();
        let target = context
            .global_object()
            .get(JsString::from(name), context)
            .map_err(|err| Error::Guest(err.to_string()))?;
        Ok(target.is_callable())
    }

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let context = self.context();
        let target = context
            .global_object()
            .get(JsString::from(name), context)
            .map_err(|err| Error::Guest(err.to_string()))?;
        let Some(callable) = target.as_callable() else {
            return Err(Error::NoSuchFunction(name.to_string()));
        };

        let js_args = args
            .iter()
            .map(|arg| value_to_js(arg, context))
            .collect::<Result<Vec<_>, _>>()?;

        match callable.call(&JsValue::undefined(), &js_args, context) {
            Ok(out) => js_to_value(&out, context),
            Err(err) => {
                let message = format!("{name} threw: {err}");
                self.log(&message);
                Err(Error::Guest(err.to_string()))
            }
        }
    }

    fn define_constant(&mut self, name: &str, value: &Value) -> Result<(), Error> {
        let context = self.context();
        let js_value = value_to_js(value, context)?;
        context
            .register_global_property(JsString::from(name), js_value, Attribute::all())
            .map_err(|err| Error::Guest(err.to_string()))
    }

    fn define_callback(&mut self, name: &str, callback: Callback) -> Result<(), Error> {
        let arity = callback.arity();
        let id = self.callbacks.borrow_mut().register(name, callback)?;

        let registry = Rc::clone(&self.callbacks);
        let sink = Rc::clone(&self.sink);
        let fname = name.to_string();

        // SAFETY: the closure captures no garbage-collected types, only
        // host-side registries.
        let native = unsafe {
            NativeFunction::from_closure(move |_this, js_args, context| {
                let args = js_args
                    .iter()
                    .map(|arg| js_to_value(arg, context))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| JsNativeError::typ().with_message(err.to_string()))?;

                let callback = registry
                    .borrow()
                    .get(id)
                    .cloned()
                    .expect("registered callback outlives the engine");

                match callback.invoke(&fname, &args) {
                    Ok(ret) => value_to_js(&ret, context)
                        .map_err(|err| JsNativeError::typ().with_message(err.to_string()).into()),
                    Err(err) => {
                        let message = format!("{fname}: {err}");
                        let sink = sink.borrow().clone();
                        sink(&message);
                        Err(JsNativeError::error().with_message(message).into())
                    }
                }
            })
        };

        self.context()
            .register_global_callable(name, arity as usize, native)
            .map_err(|err| Error::Guest(err.to_string()))
    }

    fn set_log_sink(&mut self, sink: LogSink) {
        *self.sink.borrow_mut() = sink;
    }
}
