use std::fmt;
use std::sync::Arc;

mod signature;
pub use signature::{adapt_args, adapt_return, Signature};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot convert parameter {index} from {from} to {to}")]
    Parameter { index: usize, from: Tag, to: Tag },
    #[error("cannot convert {from} to {to}")]
    NotConvertible { from: Tag, to: Tag },
    #[error("cannot convert return value from {from} to {to}")]
    Return { from: Tag, to: Tag },
    #[error("wrong number of arguments: expected {expected}, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("a callback is limited to 255 parameters, descriptor declares {0}")]
    TooManyParameters(usize),
}

/// Type tag of a [`Value`]. The discriminants double as the one-byte tags
/// used when a value crosses a process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Void = 0,
    Float32 = 1,
    Int32 = 2,
    Bool = 3,
    String = 4,
    Array = 5,
    Function = 6,
}

impl Tag {
    pub fn from_byte(b: u8) -> Option<Tag> {
        match b {
            0 => Some(Tag::Void),
            1 => Some(Tag::Float32),
            2 => Some(Tag::Int32),
            3 => Some(Tag::Bool),
            4 => Some(Tag::String),
            5 => Some(Tag::Array),
            6 => Some(Tag::Function),
            _ => None,
        }
    }

    /// Maps one letter of a type descriptor. Every letter advances exactly
    /// one position, `[` included. Unknown letters are read as strings.
    pub fn from_letter(c: char) -> Tag {
        match c {
            'v' => Tag::Void,
            'b' => Tag::Bool,
            'i' => Tag::Int32,
            'f' => Tag::Float32,
            '[' => Tag::Array,
            _ => Tag::String,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tag::Void => "void",
            Tag::Float32 => "float32",
            Tag::Int32 => "int32",
            Tag::Bool => "boolean",
            Tag::String => "string",
            Tag::Array => "array",
            Tag::Function => "function",
        })
    }
}

/// Identity of a registered native callback. Dense, assigned at
/// registration time, and stable for the life of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u32);

/// A guest-visible handle onto a registered native callback.
///
/// The handle is deliberately small: the callable itself lives in a
/// registry and is looked up by id (or name) at invocation time, so
/// cloning a Function value never clones captured state, and Function
/// values are rejected outright by the wire codec.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionHandle {
    pub id: CallbackId,
    pub name: Arc<str>,
    pub arity: u8,
}

/// A dynamically typed value exchanged between host and guest.
///
/// Arrays own their elements and strings own their bytes, so `Clone` is a
/// deep copy and `Drop` releases the whole tree. `Display` renders the
/// diagnostic dump format; it is not a wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(Vec<Value>),
    Function(FunctionHandle),
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Void => Tag::Void,
            Value::Int32(_) => Tag::Int32,
            Value::Float32(_) => Tag::Float32,
            Value::Bool(_) => Tag::Bool,
            Value::String(_) => Tag::String,
            Value::Array(_) => Tag::Array,
            Value::Function(_) => Tag::Function,
        }
    }

    /// Adapts `self` to the given tag by the numeric coercion rules:
    /// i32, f32 and bool interconvert freely and render to strings, arrays
    /// render to a short placeholder string, everything else converts only
    /// to its own tag.
    pub fn coerce(&self, to: Tag) -> Result<Value, Error> {
        if self.tag() == to {
            return Ok(self.clone());
        }
        let coerced = match (self, to) {
            (Value::Float32(v), Tag::Int32) => Some(Value::Int32(*v as i32)),
            (Value::Float32(v), Tag::Bool) => Some(Value::Bool(*v as i32 != 0)),
            (Value::Float32(v), Tag::String) => Some(Value::String(format!("{:.6}", v))),
            (Value::Int32(v), Tag::Float32) => Some(Value::Float32(*v as f32)),
            (Value::Int32(v), Tag::Bool) => Some(Value::Bool(*v != 0)),
            (Value::Int32(v), Tag::String) => Some(Value::String(v.to_string())),
            (Value::Bool(v), Tag::Float32) => Some(Value::Float32(*v as i32 as f32)),
            (Value::Bool(v), Tag::Int32) => Some(Value::Int32(*v as i32)),
            (Value::Bool(v), Tag::String) => {
                Some(Value::String(if *v { "true" } else { "false" }.to_string()))
            }
            (Value::Array(v), Tag::String) => {
                Some(Value::String(format!("<array, {} items>", v.len())))
            }
            _ => None,
        };
        coerced.ok_or(Error::NotConvertible {
            from: self.tag(),
            to,
        })
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Float32(v) => write!(f, "(f32){:.6}", v),
            Value::Int32(v) => write!(f, "(i32){}", v),
            Value::Bool(v) => write!(f, "(bool){}", *v as u8),
            Value::String(v) => write!(f, "\"{}\"", escape(v)),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Function(handle) => write!(f, "<function {}/{}>", handle.name, handle.arity),
        }
    }
}

/// Backslash-escapes control characters and quotes for the dump format.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out
}
