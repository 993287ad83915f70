//! Wall-clock enforcement for engines running in-process, without a
//! sandbox child to supervise.
//!
//! A guard arms a SIGALRM alarm around the combined compile-and-call; the
//! handler sets a process-global flag which cooperative engines observe at
//! safe points (between statements, on callback entry) and turn into
//! [`Error::Timeout`]. A synchronous engine that never reaches a safe
//! point cannot be preempted this way — the subprocess sandbox is the
//! mechanism that needs no cooperation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use value::Value;

use crate::{Engine, Error};

static EXPIRED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_alarm(_: libc::c_int) {
    EXPIRED.store(true, Ordering::SeqCst);
}

/// True once the current alarm has fired. Engines poll this at safe
/// points while executing guest code.
pub fn expired() -> bool {
    EXPIRED.load(Ordering::SeqCst)
}

/// Arms the alarm on construction; on drop — every exit path, including
/// unwinds — disarms it and restores the prior SIGALRM disposition.
pub struct AlarmGuard {
    previous: SigAction,
}

impl AlarmGuard {
    pub fn arm(budget: Duration) -> Result<AlarmGuard, Error> {
        EXPIRED.store(false, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_alarm),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // Safe: the handler only stores to an atomic.
        let previous = unsafe { sigaction(Signal::SIGALRM, &action) }
            .map_err(|errno| Error::Io(std::io::Error::from(errno)))?;

        // alarm(2) has whole-second granularity; round sub-second budgets
        // up so they arm at all.
        let secs = budget
            .as_secs()
            .saturating_add((budget.subsec_nanos() != 0) as u64)
            .clamp(1, libc::c_uint::MAX as u64);
        nix::unistd::alarm::set(secs as libc::c_uint);

        Ok(AlarmGuard { previous })
    }
}

impl Drop for AlarmGuard {
    fn drop(&mut self) {
        nix::unistd::alarm::cancel();
        let _ = unsafe { sigaction(Signal::SIGALRM, &self.previous) };
    }
}

/// Compiles `script` (when given) and calls `function` under a single
/// wall-clock budget. Returns the call result plus whether the budget
/// expired.
///
/// A missing entry point is only an error when no script was supplied
/// alongside it; startup functions are optional when compiling.
pub fn compile_and_call(
    engine: &mut dyn Engine,
    script: Option<&str>,
    function: &str,
    args: &[Value],
    budget: Duration,
) -> (Result<Value, Error>, bool) {
    let _guard = match AlarmGuard::arm(budget) {
        Ok(guard) => guard,
        Err(err) => return (Err(err), false),
    };

    let result = (|| {
        if let Some(script) = script {
            engine.compile_script(script)?;
        }
        if expired() {
            return Err(Error::Timeout);
        }
        if engine.is_function(function)? {
            engine.call_function(function, args)
        } else if script.is_some() {
            Ok(Value::Void)
        } else {
            Err(Error::NoSuchFunction(function.to_string()))
        }
    })();

    // An engine interrupted mid-run may surface the interruption as its
    // own error kind; the alarm flag is authoritative.
    let timed_out = expired() || matches!(result, Err(Error::Timeout));
    let result = if timed_out { Err(Error::Timeout) } else { result };
    (result, timed_out)
}
