//! The one-way transition that strips a sandbox child down to a fixed
//! syscall allow-list and a bounded heap.
//!
//! Runs exactly once, after the adapter's `initialize` and before any
//! guest input is read. Adapters must already have loaded everything they
//! need: after this point even `open` fails.

use std::collections::BTreeMap;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, TargetArch};

#[derive(Debug, thiserror::Error)]
pub enum LockdownError {
    #[error("couldn't install crash handlers: {0}")]
    CrashHandlers(#[source] std::io::Error),
    #[error("couldn't cap the child data segment: {0}")]
    MemoryLimit(#[source] std::io::Error),
    #[error("couldn't set no-new-privs: {0}")]
    NoNewPrivs(#[source] std::io::Error),
    #[error("couldn't install the syscall filter: {0}")]
    Filter(String),
}

/// Slack on top of the configured memory cap, covering allocator metadata
/// and the few pages the child runtime itself still needs to fault in.
pub const MEMORY_PAD: u64 = 1 << 20;

/// Locks the calling process down. Irreversible.
pub fn lockdown(memory_cap: u64) -> Result<(), LockdownError> {
    install_crash_handlers().map_err(|errno| {
        LockdownError::CrashHandlers(std::io::Error::from(errno))
    })?;

    // Private anonymous mappings count against RLIMIT_DATA on any modern
    // kernel, so this bounds the whole guest heap, not just brk.
    let limit = memory_cap.saturating_add(MEMORY_PAD);
    rlimit::setrlimit(rlimit::Resource::DATA, limit, limit)
        .map_err(LockdownError::MemoryLimit)?;

    // Must precede the filter: an unprivileged process may only install
    // seccomp filters once it can no longer regain privileges.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(LockdownError::NoNewPrivs(std::io::Error::last_os_error()));
    }

    install_filter()
}

/// Syscalls the locked-down child may still make: pipe I/O, clock reads,
/// heap management, futex (allocator and panic machinery), signal mask
/// and return, and exiting. Everything else fails with EPERM.
fn allowed_syscalls() -> Vec<i64> {
    #[allow(unused_mut)]
    let mut allowed = vec![
        libc::SYS_read,
        libc::SYS_readv,
        libc::SYS_write,
        libc::SYS_writev,
        libc::SYS_gettimeofday,
        libc::SYS_clock_gettime,
        libc::SYS_brk,
        libc::SYS_mmap,
        libc::SYS_mremap,
        libc::SYS_munmap,
        libc::SYS_futex,
        libc::SYS_rt_sigprocmask,
        libc::SYS_rt_sigreturn,
        libc::SYS_sched_yield,
        libc::SYS_exit,
        libc::SYS_exit_group,
    ];
    #[cfg(target_arch = "x86_64")]
    allowed.push(libc::SYS_time);
    allowed
}

fn install_filter() -> Result<(), LockdownError> {
    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|_| LockdownError::Filter(format!(
            "unsupported architecture {}",
            std::env::consts::ARCH
        )))?;

    // An empty rule vector allows the syscall unconditionally. The
    // generated prologue kills the process outright if the running
    // architecture doesn't match the one the filter was built for.
    let rules: BTreeMap<i64, Vec<seccompiler::SeccompRule>> = allowed_syscalls()
        .into_iter()
        .map(|nr| (nr, vec![]))
        .collect();

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Errno(libc::EPERM as u32),
        SeccompAction::Allow,
        arch,
    )
    .map_err(|err| LockdownError::Filter(err.to_string()))?;

    let program: BpfProgram = filter
        .try_into()
        .map_err(|err: seccompiler::BackendError| LockdownError::Filter(err.to_string()))?;

    seccompiler::apply_filter(&program).map_err(|err| LockdownError::Filter(err.to_string()))
}

/// Installs SIGSEGV/SIGABRT handlers that report the fault and exit with
/// the signal number, so corrupted guest state produces a predictable
/// exit instead of silent death.
fn install_crash_handlers() -> nix::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::SigAction(on_fatal_signal),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGSEGV, &action)?;
        sigaction(Signal::SIGABRT, &action)?;
    }
    Ok(())
}

extern "C" fn on_fatal_signal(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // Async-signal-safe only: raw writes of a hand-formatted line.
    let mut buf = [0u8; 64];
    let mut len = 0;
    for b in b"fatal signal " {
        buf[len] = *b;
        len += 1;
    }
    len += format_u64(signo as u64, &mut buf[len..]);
    for b in b", fault addr 0x" {
        buf[len] = *b;
        len += 1;
    }
    let addr = if info.is_null() {
        0
    } else {
        unsafe { (*info).si_addr() as usize as u64 }
    };
    len += format_hex(addr, &mut buf[len..]);
    buf[len] = b'\n';
    len += 1;

    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, len);
        libc::_exit(signo);
    }
}

fn format_u64(mut v: u64, out: &mut [u8]) -> usize {
    let mut digits = [0u8; 20];
    let mut n = 0;
    loop {
        digits[n] = b'0' + (v % 10) as u8;
        v /= 10;
        n += 1;
        if v == 0 {
            break;
        }
    }
    for i in 0..n {
        out[i] = digits[n - 1 - i];
    }
    n
}

fn format_hex(mut v: u64, out: &mut [u8]) -> usize {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut digits = [0u8; 16];
    let mut n = 0;
    loop {
        digits[n] = HEX[(v & 0xf) as usize];
        v >>= 4;
        n += 1;
        if v == 0 {
            break;
        }
    }
    for i in 0..n {
        out[i] = digits[n - 1 - i];
    }
    n
}
