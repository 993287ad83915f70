use std::io::Write;
use std::os::fd::{AsFd, AsRawFd};
use std::time::{Duration, Instant};

use value::{Tag, Value};

mod frame;
pub use frame::{Command, Reply};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("deadline exceeded while reading")]
    Deadline,
    #[error("unexpected end of stream")]
    Eof,
    #[error("negative length prefix")]
    NegativeLength,
    #[error("string of {got} bytes exceeds the {max} byte limit")]
    StringTooLong { got: usize, max: usize },
    #[error("value tree of {got} elements exceeds the {max} element limit")]
    TooManyElements { got: usize, max: usize },
    #[error("arrays nest deeper than {0} levels")]
    TooDeep(usize),
    #[error("unknown value tag {0}")]
    BadTag(u8),
    #[error("function values cannot cross the sandbox boundary")]
    FunctionOnWire,
    #[error("unexpected frame byte {0}")]
    BadFrame(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Hard caps applied while decoding values from an untrusted peer.
/// Every length prefix is checked against its cap before any allocation,
/// and array recursion is depth-bounded, so a hostile child cannot force
/// unbounded memory or stack use on the parent.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum byte length of a single decoded string.
    pub max_string: usize,
    /// Maximum total element count across an entire decoded value tree.
    pub max_elements: usize,
    /// Maximum array nesting depth.
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_string: 4096,
            max_elements: 1024,
            max_depth: 64,
        }
    }
}

impl Limits {
    /// No caps. Only appropriate when the peer is trusted, e.g. the child
    /// reading frames written by its own parent.
    pub fn unbounded() -> Limits {
        Limits {
            max_string: usize::MAX,
            max_elements: usize::MAX,
            max_depth: usize::MAX,
        }
    }
}

/// Remaining wall-clock budget for a read. The budget is shared: one
/// `Deadline` is threaded through every read of a command cycle, so the
/// cycle as a whole observes a single limit no matter how many frames it
/// exchanges.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(budget: Duration) -> Deadline {
        Deadline(Some(Instant::now() + budget))
    }

    pub fn unlimited() -> Deadline {
        Deadline(None)
    }

    pub fn expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Remaining budget, or `None` when unlimited.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Reads exactly `buf.len()` bytes, waiting at most until the deadline.
///
/// Waits are implemented with `poll(2)` against the remaining budget and
/// retried on EINTR. EOF before the buffer is full is an error: frames are
/// never legitimately split by stream shutdown.
pub fn read_exact(fd: &impl AsFd, buf: &mut [u8], deadline: &Deadline) -> Result<(), Error> {
    use nix::poll::{poll, PollFd, PollFlags};

    let mut pos = 0;
    while pos < buf.len() {
        if let Some(remaining) = deadline.remaining() {
            if remaining.is_zero() {
                return Err(Error::Deadline);
            }
            let timeout = remaining.as_millis().min(i32::MAX as u128) as i32;
            // Rounding the budget down to whole milliseconds could spin on a
            // sub-millisecond remainder, so wait at least one.
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            let ready = match poll(&mut fds, timeout.max(1)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(std::io::Error::from(errno).into()),
            };
            if ready == 0 {
                return Err(Error::Deadline);
            }
        }

        match nix::unistd::read(fd.as_fd().as_raw_fd(), &mut buf[pos..]) {
            Ok(0) => return Err(Error::Eof),
            Ok(n) => pos += n,
            Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => continue,
            Err(errno) => return Err(std::io::Error::from(errno).into()),
        }
    }
    Ok(())
}

pub fn read_u8(fd: &impl AsFd, deadline: &Deadline) -> Result<u8, Error> {
    let mut buf = [0u8; 1];
    read_exact(fd, &mut buf, deadline)?;
    Ok(buf[0])
}

pub fn read_i32(fd: &impl AsFd, deadline: &Deadline) -> Result<i32, Error> {
    let mut buf = [0u8; 4];
    read_exact(fd, &mut buf, deadline)?;
    Ok(i32::from_le_bytes(buf))
}

/// Reads a length-prefixed string, checking the length against the cap
/// before allocating.
pub fn read_string(
    fd: &impl AsFd,
    limits: &Limits,
    deadline: &Deadline,
) -> Result<String, Error> {
    let len = read_i32(fd, deadline)?;
    if len < 0 {
        return Err(Error::NegativeLength);
    }
    let len = len as usize;
    if len > limits.max_string {
        return Err(Error::StringTooLong {
            got: len,
            max: limits.max_string,
        });
    }
    let mut buf = vec![0u8; len];
    read_exact(fd, &mut buf, deadline)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Reads one tagged value. Array element counts accumulate across the
/// whole tree against `limits.max_elements`.
pub fn read_value(fd: &impl AsFd, limits: &Limits, deadline: &Deadline) -> Result<Value, Error> {
    let mut elements = 0usize;
    read_value_inner(fd, limits, deadline, &mut elements, 0)
}

fn read_value_inner(
    fd: &impl AsFd,
    limits: &Limits,
    deadline: &Deadline,
    elements: &mut usize,
    depth: usize,
) -> Result<Value, Error> {
    let tag = read_u8(fd, deadline)?;
    match Tag::from_byte(tag).ok_or(Error::BadTag(tag))? {
        Tag::Void => Ok(Value::Void),
        Tag::Float32 => {
            let mut buf = [0u8; 4];
            read_exact(fd, &mut buf, deadline)?;
            Ok(Value::Float32(f32::from_le_bytes(buf)))
        }
        Tag::Int32 => Ok(Value::Int32(read_i32(fd, deadline)?)),
        Tag::Bool => Ok(Value::Bool(read_u8(fd, deadline)? != 0)),
        Tag::String => Ok(Value::String(read_string(fd, limits, deadline)?)),
        Tag::Array => {
            if depth + 1 > limits.max_depth {
                return Err(Error::TooDeep(limits.max_depth));
            }
            let len = read_i32(fd, deadline)?;
            if len < 0 {
                return Err(Error::NegativeLength);
            }
            let len = len as usize;
            *elements = elements.saturating_add(len);
            if *elements > limits.max_elements {
                return Err(Error::TooManyElements {
                    got: *elements,
                    max: limits.max_elements,
                });
            }
            let mut items = Vec::with_capacity(len.min(limits.max_elements));
            for _ in 0..len {
                items.push(read_value_inner(fd, limits, deadline, elements, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        Tag::Function => Err(Error::FunctionOnWire),
    }
}

pub fn put_u8(buf: &mut Vec<u8>, b: u8) {
    buf.push(b);
}

pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_i32(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// Encodes one tagged value. Function values are rejected: the callable
/// they stand for is process-local and cannot be rehydrated by the peer.
pub fn put_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), Error> {
    put_u8(buf, value.tag() as u8);
    match value {
        Value::Void => {}
        Value::Float32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Int32(v) => put_i32(buf, *v),
        Value::Bool(v) => put_u8(buf, *v as u8),
        Value::String(v) => put_string(buf, v),
        Value::Array(items) => {
            put_i32(buf, items.len() as i32);
            for item in items {
                put_value(buf, item)?;
            }
        }
        Value::Function(_) => {
            buf.pop();
            return Err(Error::FunctionOnWire);
        }
    }
    Ok(())
}

/// Writes a fully encoded frame in one call.
pub fn write_frame(w: &mut impl Write, buf: &[u8]) -> Result<(), Error> {
    w.write_all(buf)?;
    w.flush()?;
    Ok(())
}
