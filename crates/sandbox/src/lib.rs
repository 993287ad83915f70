//! Cross-process supervision of an untrusted interpreter.
//!
//! [`Sandbox::spawn`] forks a child that owns the real engine adapter,
//! locks the child down ([`lockdown`]), and implements the [`Engine`]
//! contract in the parent by framing every operation as a command on a
//! pipe pair. Guest-initiated callbacks flow back through the same pipes
//! and are dispatched against a parent-side registry.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};

use engine::{Callback, CallbackRegistry, Engine, Error, LogSink};
use value::Value;
use wire::{Command, Deadline, Reply};

mod child;
mod lockdown;

pub use child::{EXIT_FATAL, EXIT_INIT_REFUSED, EXIT_MEMORY_SETUP, EXIT_OK, EXIT_OOM};
pub use lockdown::{lockdown, LockdownError, MEMORY_PAD};

/// Resource limits applied to one sandboxed interpreter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock budget for one command, shared with every callback the
    /// command triggers.
    #[serde(with = "humantime_serde")]
    pub call_deadline: Duration,
    /// Heap ceiling for the child, enforced via RLIMIT_DATA.
    pub memory_cap: u64,
    /// Longest string the parent will accept from the child.
    pub max_wire_string: usize,
    /// Largest total element count the parent will accept across one
    /// decoded value tree.
    pub max_wire_elements: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            call_deadline: Duration::from_secs(10),
            memory_cap: 64 << 20,
            max_wire_string: 4096,
            max_wire_elements: 1024,
        }
    }
}

impl SandboxConfig {
    pub fn wire_limits(&self) -> wire::Limits {
        wire::Limits {
            max_string: self.max_wire_string,
            max_elements: self.max_wire_elements,
            ..wire::Limits::default()
        }
    }
}

/// The parent half of a sandboxed interpreter. Cloning yields another
/// handle onto the same child; the child is killed and reaped when the
/// last handle drops.
#[derive(Clone)]
pub struct Sandbox {
    shared: Rc<Shared>,
}

struct Shared {
    child: Pid,
    reader: os_pipe::PipeReader,
    writer: RefCell<os_pipe::PipeWriter>,
    callbacks: RefCell<CallbackRegistry>,
    sink: RefCell<LogSink>,
    in_call: Cell<bool>,
    timed_out: Cell<bool>,
    call_deadline: Cell<Duration>,
    limits: wire::Limits,
}

impl Sandbox {
    /// Forks the sandbox child and hands it `inner`, which it initializes
    /// with the configured memory cap and then locks down. The parent's
    /// copy of the adapter is dropped: after the fork only the child's
    /// copy is live.
    pub fn spawn(inner: Box<dyn Engine>, config: &SandboxConfig) -> Result<Sandbox, Error> {
        let (parent_reader, child_writer) = os_pipe::pipe()?;
        let (child_reader, parent_writer) = os_pipe::pipe()?;

        // SAFETY: the child branch never returns into caller code — it
        // serves the command loop and `_exit`s. Allocation in the child is
        // only safe while the parent is effectively single-threaded at
        // fork time, which holds for the intended embedding.
        match unsafe { nix::unistd::fork() }
            .map_err(|errno| Error::Io(std::io::Error::from(errno)))?
        {
            ForkResult::Child => {
                drop(parent_reader);
                drop(parent_writer);
                child::run(inner, child_reader, child_writer, config)
            }
            ForkResult::Parent { child } => {
                drop(child_reader);
                drop(child_writer);
                tracing::debug!(
                    pid = child.as_raw(),
                    engine = inner.name(),
                    "spawned sandbox child"
                );
                drop(inner);
                Ok(Sandbox {
                    shared: Rc::new(Shared {
                        child,
                        reader: parent_reader,
                        writer: RefCell::new(parent_writer),
                        callbacks: RefCell::new(CallbackRegistry::new()),
                        sink: RefCell::new(engine::default_log_sink()),
                        in_call: Cell::new(false),
                        timed_out: Cell::new(false),
                        call_deadline: Cell::new(config.call_deadline),
                        limits: config.wire_limits(),
                    }),
                })
            }
        }
    }

    /// A weak handle for use from inside host callbacks. Handles do not
    /// keep the child alive, and — like every other operation — refuse
    /// re-entrant invocation while a command is in flight.
    pub fn handle(&self) -> SandboxHandle {
        SandboxHandle {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Whether the most recent operation failed by exhausting its
    /// deadline, distinguishing slow guests from broken ones.
    pub fn timed_out(&self) -> bool {
        self.shared.timed_out.get()
    }

    pub fn set_call_deadline(&self, budget: Duration) {
        self.shared.call_deadline.set(budget);
    }

    pub fn call_deadline(&self) -> Duration {
        self.shared.call_deadline.get()
    }

    pub fn child_pid(&self) -> libc::pid_t {
        self.shared.child.as_raw()
    }
}

impl Engine for Sandbox {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    /// The child adapter was already initialized at spawn time, before
    /// lockdown; there is nothing left to do in the parent.
    fn initialize(&mut self, _memory_cap: u64) -> Result<(), Error> {
        Ok(())
    }

    fn compile_script(&mut self, source: &str) -> Result<(), Error> {
        self.shared.cmd_compile_script(source)
    }

    fn is_function(&mut self, name: &str) -> Result<bool, Error> {
        self.shared.cmd_is_function(name)
    }

    fn call_function(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        self.shared.cmd_call_function(name, args)
    }

    fn define_constant(&mut self, name: &str, value: &Value) -> Result<(), Error> {
        self.shared.cmd_define_constant(name, value)
    }

    fn define_callback(&mut self, name: &str, callback: Callback) -> Result<(), Error> {
        self.shared.cmd_define_callback(name, callback)
    }

    fn set_log_sink(&mut self, sink: LogSink) {
        *self.shared.sink.borrow_mut() = sink;
    }
}

/// Weak reference onto a [`Sandbox`], safe to capture inside callbacks
/// without keeping the child process alive through a reference cycle.
#[derive(Clone)]
pub struct SandboxHandle {
    shared: Weak<Shared>,
}

impl SandboxHandle {
    fn shared(&self) -> Result<Rc<Shared>, Error> {
        self.shared.upgrade().ok_or(Error::ChildDied)
    }

    pub fn compile_script(&self, source: &str) -> Result<(), Error> {
        self.shared()?.cmd_compile_script(source)
    }

    pub fn is_function(&self, name: &str) -> Result<bool, Error> {
        self.shared()?.cmd_is_function(name)
    }

    pub fn call_function(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        self.shared()?.cmd_call_function(name, args)
    }
}

/// Clears `in_call` when a command cycle ends, on every path out.
struct CallGuard<'a>(&'a Shared);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.in_call.set(false);
    }
}

impl Shared {
    /// Entry gate for every operation that touches the pipes. While a
    /// command is in flight its host callbacks run on this same thread;
    /// any operation they attempt would interleave frames into the
    /// in-flight exchange and desynchronize both sides, so it is refused
    /// before a single byte is written.
    fn begin(&self) -> Result<CallGuard<'_>, Error> {
        if self.in_call.get() {
            return Err(Error::Reentrant);
        }
        self.in_call.set(true);
        self.timed_out.set(false);
        Ok(CallGuard(self))
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.call_deadline.get())
    }

    fn send(&self, buf: &[u8]) -> Result<(), Error> {
        wire::write_frame(&mut *self.writer.borrow_mut(), buf)
            .map_err(|err| self.map_wire(err))
    }

    fn map_wire(&self, err: wire::Error) -> Error {
        match err {
            wire::Error::Deadline => {
                self.timed_out.set(true);
                Error::Timeout
            }
            wire::Error::Eof => Error::ChildDied,
            wire::Error::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe => {
                Error::ChildDied
            }
            other => Error::Wire(other),
        }
    }

    /// Drains child frames until the in-flight command terminates with
    /// `RETURN` (whose payload the caller then reads under the same
    /// deadline) or `ERROR`.
    fn process_replies(&self, deadline: &Deadline) -> Result<(), Error> {
        loop {
            let byte = wire::read_u8(&self.reader, deadline).map_err(|e| self.map_wire(e))?;
            match Reply::from_byte(byte).ok_or(Error::Wire(wire::Error::BadFrame(byte)))? {
                Reply::Return => return Ok(()),
                Reply::Error => {
                    return Err(Error::Guest(
                        "the guest reported an error (details in the guest log)".to_string(),
                    ))
                }
                Reply::Log => {
                    let message = wire::read_string(&self.reader, &self.limits, deadline)
                        .map_err(|e| self.map_wire(e))?;
                    let sink = self.sink.borrow().clone();
                    sink(&message);
                }
                Reply::Callback => {
                    let name = wire::read_string(&self.reader, &self.limits, deadline)
                        .map_err(|e| self.map_wire(e))?;
                    let args = wire::read_value(&self.reader, &self.limits, deadline)
                        .map_err(|e| self.map_wire(e))?;
                    let Value::Array(args) = args else {
                        return Err(Error::Wire(wire::Error::BadFrame(byte)));
                    };

                    // Clone out of the registry so the callback runs with
                    // no borrow held; it may legitimately consult the
                    // sandbox (and be told "re-entrant").
                    let callback = self
                        .callbacks
                        .borrow()
                        .get_by_name(&name)
                        .map(|(_, cb)| cb.clone());
                    let Some(callback) = callback else {
                        return Err(Error::UnknownCallback(name));
                    };
                    let ret = callback.invoke(&name, &args)?;

                    let mut buf = Vec::new();
                    wire::put_value(&mut buf, &ret).map_err(Error::Wire)?;
                    self.send(&buf)?;
                }
            }
        }
    }

    fn cmd_define_constant(&self, name: &str, value: &Value) -> Result<(), Error> {
        let _guard = self.begin()?;
        tracing::debug!(name, "define_constant");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Command::DefineConstant as u8);
        wire::put_string(&mut buf, name);
        wire::put_value(&mut buf, value).map_err(Error::Wire)?;
        let deadline = self.deadline();
        self.send(&buf)?;
        self.process_replies(&deadline)
    }

    fn cmd_define_callback(&self, name: &str, callback: Callback) -> Result<(), Error> {
        let _guard = self.begin()?;
        tracing::debug!(name, arity = callback.arity(), "define_function");
        if self.callbacks.borrow().get_by_name(name).is_some() {
            return Err(Error::DuplicateCallback(name.to_string()));
        }

        // Tell the child to install a proxy of matching arity before the
        // registration becomes visible to dispatch.
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Command::DefineFunction as u8);
        wire::put_string(&mut buf, name);
        wire::put_u8(&mut buf, callback.arity());
        let deadline = self.deadline();
        self.send(&buf)?;
        self.process_replies(&deadline)?;

        // Register only once the child has confirmed its proxy: a name
        // whose installation failed must stay free for a retry rather
        // than sit in the registry with no child-side counterpart.
        self.callbacks.borrow_mut().register(name, callback)?;
        Ok(())
    }

    fn cmd_compile_script(&self, source: &str) -> Result<(), Error> {
        let _guard = self.begin()?;
        tracing::debug!("compile_script");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Command::CompileScript as u8);
        wire::put_string(&mut buf, source);
        let deadline = self.deadline();
        self.send(&buf)?;
        self.process_replies(&deadline)?;

        let status = wire::read_u8(&self.reader, &deadline).map_err(|e| self.map_wire(e))?;
        if status != 0 {
            Ok(())
        } else {
            Err(Error::Compile(
                "the guest engine rejected the script (details in the guest log)".to_string(),
            ))
        }
    }

    fn cmd_is_function(&self, name: &str) -> Result<bool, Error> {
        let _guard = self.begin()?;
        tracing::debug!(name, "is_function");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Command::IsFunction as u8);
        wire::put_string(&mut buf, name);
        let deadline = self.deadline();
        self.send(&buf)?;
        self.process_replies(&deadline)?;

        Ok(wire::read_u8(&self.reader, &deadline).map_err(|e| self.map_wire(e))? != 0)
    }

    fn cmd_call_function(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let _guard = self.begin()?;
        tracing::debug!(name, "call_function");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Command::CallFunction as u8);
        wire::put_string(&mut buf, name);
        wire::put_value(&mut buf, &Value::Array(args.to_vec())).map_err(Error::Wire)?;
        let deadline = self.deadline();
        self.send(&buf)?;
        self.process_replies(&deadline)?;

        wire::read_value(&self.reader, &self.limits, &deadline).map_err(|e| self.map_wire(e))
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Reap without blocking if the child already exited; otherwise
        // force the issue. Destroying a supervisor is the documented way
        // to get rid of a wedged guest.
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                tracing::debug!(pid = self.child.as_raw(), "killing sandbox child");
                let _ = kill(self.child, Signal::SIGKILL);
                let _ = waitpid(self.child, None);
            }
            Ok(status) => {
                tracing::debug!(?status, "sandbox child already exited");
            }
            Err(errno) => {
                tracing::debug!(%errno, pid = self.child.as_raw(), "sandbox child wait failed");
            }
        }
    }
}
