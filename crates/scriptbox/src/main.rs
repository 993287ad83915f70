//! CLI harness: compile a guest script inside a sandboxed interpreter,
//! bind the canonical native set, call its `test` entry point, and exit
//! with a status reflecting the outcome.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use scriptbox::{Interpreter, SandboxConfig, Value};

#[derive(Debug, Parser)]
#[command(name = "scriptbox", about = "Runs an untrusted guest script in a sandboxed interpreter")]
struct Args {
    /// Path to the guest script. The interpreter is chosen from the file
    /// extension; anything unrecognized runs as JavaScript.
    script: PathBuf,

    /// Run the interpreter in-process, without the sandbox child.
    #[arg(short = 'u', long)]
    unsandboxed: bool,

    /// Wall-clock budget for compiling the script plus calling the entry
    /// point, e.g. "10s" or "1500ms".
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Heap ceiling for the sandbox child, in bytes.
    #[arg(long, default_value_t = 64 << 20)]
    max_memory: u64,

    /// Guest entry point to call after the script compiles.
    #[arg(long, default_value = "test")]
    entry: String,

    /// The log verbosity. Can be one of trace|debug|info|warn|error|off.
    #[arg(long = "log.level", default_value = "warn")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.log_level.as_str())
        .with_target(false)
        .init();

    let source = std::fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read {}", args.script.display()))?;

    let config = SandboxConfig {
        call_deadline: args.timeout,
        memory_cap: args.max_memory,
        ..SandboxConfig::default()
    };

    let mut interpreter = if args.unsandboxed {
        Interpreter::by_extension_unsandboxed(&args.script, &config)
    } else {
        Interpreter::by_extension(&args.script, &config)
    }
    .context("failed to create the interpreter")?;

    register_natives(&mut interpreter)?;
    interpreter.define_int_constant("global_int", 3)?;
    interpreter.define_string_constant("global_string", "bàz")?;

    match interpreter.compile_and_call_with_timeout(Some(&source), &args.entry, &[], args.timeout)
    {
        Ok(value) => {
            println!("{value}");
            Ok(())
        }
        Err(_) if interpreter.timed_out() => {
            anyhow::bail!("guest exceeded the {:?} budget", args.timeout)
        }
        Err(err) => Err(anyhow::Error::from(err)).with_context(|| {
            format!(
                "running {} failed{}",
                args.script.display(),
                interpreter
                    .last_error()
                    .map(|text| format!(": {text}"))
                    .unwrap_or_default()
            )
        }),
    }
}

/// The canonical native set guest scripts may exercise.
fn register_natives(interpreter: &mut Interpreter) -> anyhow::Result<()> {
    interpreter.define_function("trace", "s", "", |args| {
        if let Value::String(message) = &args[0] {
            println!("{message}");
        }
        Ok(Value::Void)
    })?;

    interpreter.define_function("get_array", "ii", "[", |args| {
        let (Value::Int32(width), Value::Int32(height)) = (&args[0], &args[1]) else {
            anyhow::bail!("expected two integers");
        };
        let columns = (0..*width)
            .map(|x| {
                Value::Array(
                    (0..*height)
                        .map(|y| Value::Int32(x * 10 + y))
                        .collect(),
                )
            })
            .collect();
        Ok(Value::Array(columns))
    })?;

    interpreter.define_function("add2", "ii", "i", |args| int_fold(args, 0, |a, b| a + b))?;
    interpreter.define_function("add3", "iii", "i", |args| int_fold(args, 0, |a, b| a + b))?;
    interpreter.define_function("fadd2", "ff", "f", |args| float_fold(args, 0.0, |a, b| a + b))?;
    interpreter.define_function("fadd3", "fff", "f", |args| float_fold(args, 0.0, |a, b| a + b))?;

    interpreter.define_function("concat_strings", "ss", "s", |args| {
        let (Value::String(a), Value::String(b)) = (&args[0], &args[1]) else {
            anyhow::bail!("expected two strings");
        };
        Ok(Value::String(format!("{a}{b}")))
    })?;

    interpreter.define_function("concat_arrays", "[[", "[", |args| {
        let (Value::Array(a), Value::Array(b)) = (&args[0], &args[1]) else {
            anyhow::bail!("expected two arrays");
        };
        let mut out = a.clone();
        out.extend(b.iter().cloned());
        Ok(Value::Array(out))
    })?;

    interpreter.define_function("negate", "b", "b", |args| {
        let Value::Bool(b) = &args[0] else {
            anyhow::bail!("expected a boolean");
        };
        Ok(Value::Bool(!b))
    })?;

    Ok(())
}

fn int_fold(args: &[Value], init: i32, f: impl Fn(i32, i32) -> i32) -> anyhow::Result<Value> {
    let mut acc = init;
    for arg in args {
        let Value::Int32(v) = arg else {
            anyhow::bail!("expected integer arguments");
        };
        acc = f(acc, *v);
    }
    Ok(Value::Int32(acc))
}

fn float_fold(args: &[Value], init: f32, f: impl Fn(f32, f32) -> f32) -> anyhow::Result<Value> {
    let mut acc = init;
    for arg in args {
        let Value::Float32(v) = arg else {
            anyhow::bail!("expected float arguments");
        };
        acc = f(acc, *v);
    }
    Ok(Value::Float32(acc))
}
