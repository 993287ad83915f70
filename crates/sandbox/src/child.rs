//! The sandbox child: owns the real engine adapter, decodes commands from
//! the parent, and frames replies (and guest-initiated callbacks) back.
//!
//! The child trusts its parent completely — command decoding is unbounded
//! — while the parent trusts the child not at all.

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use engine::{Callback, Engine, Error};
use value::Value;
use wire::{Command, Deadline, Limits, Reply};

use crate::lockdown::{lockdown, LockdownError};
use crate::SandboxConfig;

/// Parent closed the command pipe at a frame boundary.
pub const EXIT_OK: i32 = 0;
/// Protocol failure, or the adapter panicked the child runtime.
pub const EXIT_FATAL: i32 = 1;
/// The adapter reported memory exhaustion.
pub const EXIT_OOM: i32 = 5;
/// The heap ceiling could not be reserved before lockdown.
pub const EXIT_MEMORY_SETUP: i32 = 7;
/// The adapter's `initialize` refused to start.
pub const EXIT_INIT_REFUSED: i32 = 44;

struct ChildPipes {
    reader: os_pipe::PipeReader,
    writer: RefCell<os_pipe::PipeWriter>,
}

impl ChildPipes {
    fn write_frame(&self, buf: &[u8]) -> Result<(), wire::Error> {
        wire::write_frame(&mut *self.writer.borrow_mut(), buf)
    }
}

fn exit(code: i32) -> ! {
    // _exit, not exit: the forked child must not run the parent's atexit
    // hooks or flush its inherited buffers.
    unsafe { libc::_exit(code) }
}

pub(crate) fn run(
    mut inner: Box<dyn Engine>,
    reader: os_pipe::PipeReader,
    writer: os_pipe::PipeWriter,
    config: &SandboxConfig,
) -> ! {
    close_inherited_fds(reader.as_raw_fd(), writer.as_raw_fd());

    // An orphaned child has nobody left to read its frames.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
    }

    // The adapter loads everything it will ever need from the outside
    // world here, while syscalls are still fully available.
    if let Err(err) = inner.initialize(config.memory_cap) {
        tracing::error!(error = %err, "adapter refused to initialize in the sandbox child");
        exit(EXIT_INIT_REFUSED);
    }

    let pipes = Rc::new(ChildPipes {
        reader,
        writer: RefCell::new(writer),
    });

    // Guest log output becomes LOG frames; the parent re-emits them.
    {
        let pipes = Rc::clone(&pipes);
        inner.set_log_sink(Rc::new(move |message: &str| {
            let mut buf = Vec::new();
            wire::put_u8(&mut buf, Reply::Log as u8);
            wire::put_string(&mut buf, message);
            // A write failure means the parent is gone; the command loop
            // will notice on its next read.
            let _ = pipes.write_frame(&buf);
        }));
    }

    if let Err(err) = lockdown(config.memory_cap) {
        tracing::error!(error = %err, "sandbox lockdown failed");
        match err {
            LockdownError::MemoryLimit(_) => exit(EXIT_MEMORY_SETUP),
            _ => exit(EXIT_FATAL),
        }
    }

    serve(inner.as_mut(), &pipes)
}

fn serve(engine: &mut dyn Engine, pipes: &Rc<ChildPipes>) -> ! {
    let unlimited = Deadline::unlimited();

    loop {
        let byte = match wire::read_u8(&pipes.reader, &unlimited) {
            Ok(byte) => byte,
            Err(wire::Error::Eof) => exit(EXIT_OK),
            Err(err) => {
                tracing::debug!(error = %err, "couldn't read command, parent terminated?");
                exit(EXIT_FATAL);
            }
        };
        let Some(command) = Command::from_byte(byte) else {
            tracing::error!(byte, "invalid command");
            exit(EXIT_FATAL);
        };

        if let Err(err) = serve_command(engine, pipes, command) {
            tracing::debug!(error = %err, ?command, "protocol failure");
            exit(EXIT_FATAL);
        }
    }
}

fn serve_command(
    engine: &mut dyn Engine,
    pipes: &Rc<ChildPipes>,
    command: Command,
) -> Result<(), wire::Error> {
    let limits = Limits::unbounded();
    let unlimited = Deadline::unlimited();

    match command {
        Command::DefineConstant => {
            let name = wire::read_string(&pipes.reader, &limits, &unlimited)?;
            let value = wire::read_value(&pipes.reader, &limits, &unlimited)?;
            tracing::debug!(%name, "child: define_constant");
            match engine.define_constant(&name, &value) {
                Ok(()) => reply_return(pipes, &[]),
                Err(err) => reply_guest_error(pipes, &err),
            }
        }
        Command::DefineFunction => {
            let name = wire::read_string(&pipes.reader, &limits, &unlimited)?;
            let arity = wire::read_u8(&pipes.reader, &unlimited)?;
            tracing::debug!(%name, arity, "child: define_function");
            let proxy = proxy_callback(Rc::clone(pipes), name.clone(), arity);
            match engine.define_callback(&name, proxy) {
                Ok(()) => reply_return(pipes, &[]),
                Err(err) => reply_guest_error(pipes, &err),
            }
        }
        Command::CompileScript => {
            let source = wire::read_string(&pipes.reader, &limits, &unlimited)?;
            tracing::debug!("child: compile_script");
            match engine.compile_script(&source) {
                Ok(()) => reply_return(pipes, &[1]),
                Err(err) => {
                    log_to_parent(pipes, &format!("{err:#}"));
                    reply_return(pipes, &[0])
                }
            }
        }
        Command::IsFunction => {
            let name = wire::read_string(&pipes.reader, &limits, &unlimited)?;
            tracing::debug!(%name, "child: is_function");
            match engine.is_function(&name) {
                Ok(found) => reply_return(pipes, &[found as u8]),
                Err(err) => reply_guest_error(pipes, &err),
            }
        }
        Command::CallFunction => {
            let name = wire::read_string(&pipes.reader, &limits, &unlimited)?;
            let args = wire::read_value(&pipes.reader, &limits, &unlimited)?;
            let Value::Array(args) = args else {
                return Err(wire::Error::BadFrame(Command::CallFunction as u8));
            };
            tracing::debug!(%name, "child: call_function");
            match engine.call_function(&name, &args) {
                Ok(ret) => {
                    let mut buf = Vec::new();
                    wire::put_u8(&mut buf, Reply::Return as u8);
                    if wire::put_value(&mut buf, &ret).is_err() {
                        // A Function return cannot cross the boundary.
                        log_to_parent(
                            pipes,
                            &format!("function {name} returned an unserializable value"),
                        );
                        reply_error(pipes)
                    } else {
                        pipes.write_frame(&buf)
                    }
                }
                Err(Error::OutOfMemory) => {
                    log_to_parent(pipes, "guest ran out of memory");
                    exit(EXIT_OOM);
                }
                Err(err) => reply_guest_error(pipes, &err),
            }
        }
    }
}

/// Installs the child-side stand-in for a host-registered function: a
/// callback that frames the invocation to the parent and blocks on the
/// typed reply. The reply comes from trusted parent code, so the read is
/// unbounded.
fn proxy_callback(pipes: Rc<ChildPipes>, name: String, arity: u8) -> Callback {
    Callback::passthrough(arity, move |args| {
        tracing::debug!(%name, "child: invoking host callback");
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, Reply::Callback as u8);
        wire::put_string(&mut buf, &name);
        wire::put_value(&mut buf, &Value::Array(args.to_vec()))?;
        pipes.write_frame(&buf)?;

        let reply = wire::read_value(&pipes.reader, &Limits::unbounded(), &Deadline::unlimited())?;
        Ok(reply)
    })
}

fn reply_return(pipes: &ChildPipes, payload: &[u8]) -> Result<(), wire::Error> {
    let mut buf = Vec::new();
    wire::put_u8(&mut buf, Reply::Return as u8);
    buf.extend_from_slice(payload);
    pipes.write_frame(&buf)
}

fn reply_error(pipes: &ChildPipes) -> Result<(), wire::Error> {
    pipes.write_frame(&[Reply::Error as u8])
}

fn reply_guest_error(pipes: &ChildPipes, err: &Error) -> Result<(), wire::Error> {
    log_to_parent(pipes, &format!("{err:#}"));
    reply_error(pipes)
}

fn log_to_parent(pipes: &ChildPipes, message: &str) {
    let mut buf = Vec::new();
    wire::put_u8(&mut buf, Reply::Log as u8);
    wire::put_string(&mut buf, message);
    let _ = pipes.write_frame(&buf);
}

/// Closes every descriptor the child inherited other than stdout, stderr
/// and its two pipe ends. Whatever the embedding application had open —
/// sockets, files, other sandboxes' pipes — is unreachable from guest
/// code afterwards.
fn close_inherited_fds(keep_a: libc::c_int, keep_b: libc::c_int) {
    let keep = [libc::STDOUT_FILENO, libc::STDERR_FILENO, keep_a, keep_b];
    let max = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n < 0 => 1024,
        n => n.min(1 << 20),
    } as libc::c_int;

    for fd in 0..max {
        if !keep.contains(&fd) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}
