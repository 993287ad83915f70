//! End-to-end scenarios against the JavaScript adapter running inside
//! the sandbox supervisor.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use scriptbox::{Error, Interpreter, SandboxConfig, Value};

fn sandboxed(deadline: Duration) -> Interpreter {
    let config = SandboxConfig {
        call_deadline: deadline,
        ..SandboxConfig::default()
    };
    Interpreter::by_extension("guest.js", &config).unwrap()
}

#[test]
fn test_echo_through_a_native_callback() {
    let mut interp = sandboxed(Duration::from_secs(5));
    interp
        .define_function("concat_strings", "ss", "s", |args| {
            let (Value::String(a), Value::String(b)) = (&args[0], &args[1]) else {
                anyhow::bail!("expected two strings");
            };
            Ok(Value::String(format!("{a}{b}")))
        })
        .unwrap();

    interp
        .compile_script(r#"function test() { return concat_strings("foo", "bar"); }"#)
        .unwrap();
    let out = interp.call_function("test", &[]).unwrap();
    assert_eq!(out, Value::String("foobar".to_string()));
}

#[test]
fn test_array_round_trip_through_a_native_callback() {
    let mut interp = sandboxed(Duration::from_secs(5));
    interp
        .define_function("concat_arrays", "[[", "[", |args| {
            let (Value::Array(a), Value::Array(b)) = (&args[0], &args[1]) else {
                anyhow::bail!("expected two arrays");
            };
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::Array(out))
        })
        .unwrap();

    interp
        .compile_script(r#"function test() { return concat_arrays([1, 2], [3, 4]); }"#)
        .unwrap();
    let out = interp.call_function("test", &[]).unwrap();
    assert_eq!(
        out,
        Value::Array(vec![
            Value::Int32(1),
            Value::Int32(2),
            Value::Int32(3),
            Value::Int32(4),
        ])
    );
}

#[test]
fn test_runaway_guest_hits_the_deadline() {
    let mut interp = sandboxed(Duration::from_secs(1));
    interp
        .compile_script("function test() { while (true) {} }")
        .unwrap();

    let started = Instant::now();
    let result = interp.call_function("test", &[]);
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    assert!(interp.timed_out());
    assert!(interp.last_error().is_some());
    assert!(started.elapsed() < Duration::from_secs(5));

    // Dropping the interpreter SIGKILLs the spinning child.
    drop(interp);
}

#[test]
fn test_guest_cannot_reach_the_filesystem() {
    let mut interp = sandboxed(Duration::from_secs(5));

    let leaked = Rc::new(Cell::new(false));
    let observer = Rc::clone(&leaked);
    interp
        .define_function("leak", "s", "", move |_| {
            observer.set(true);
            Ok(Value::Void)
        })
        .unwrap();

    // The guest has no filesystem API at all; the attempt throws before
    // the observer callback could ever run.
    interp
        .compile_script(
            r#"
            function test() {
                var data = open("/etc/passwd");
                leak(data);
                return data;
            }
            "#,
        )
        .unwrap();

    let result = interp.call_function("test", &[]);
    assert!(result.is_err(), "{result:?}");
    assert!(!leaked.get(), "the observer callback ran");
}

#[test]
fn test_callback_arithmetic_crosses_once() {
    let mut interp = sandboxed(Duration::from_secs(5));

    let calls = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&calls);
    interp
        .define_function("add2", "ii", "i", move |args| {
            counter.set(counter.get() + 1);
            let (Value::Int32(a), Value::Int32(b)) = (&args[0], &args[1]) else {
                anyhow::bail!("expected two integers");
            };
            Ok(Value::Int32(a + b))
        })
        .unwrap();

    interp
        .compile_script("function test() { return add2(21, 21); }")
        .unwrap();
    let out = interp.call_function("test", &[]).unwrap();
    assert_eq!(out, Value::Int32(42));
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_reentrant_callback_is_rejected() {
    let mut interp = sandboxed(Duration::from_secs(5));

    let handle = interp.sandbox_handle().unwrap();
    let rejected = Rc::new(Cell::new(false));
    let saw = Rc::clone(&rejected);
    interp
        .define_function("evil", "", "i", move |_| {
            match handle.call_function("test", &[]) {
                Err(Error::Reentrant) => {
                    saw.set(true);
                    Ok(Value::Int32(7))
                }
                other => anyhow::bail!("re-entry was not rejected: {other:?}"),
            }
        })
        .unwrap();

    interp
        .compile_script("function test() { return evil(); }")
        .unwrap();
    let out = interp.call_function("test", &[]).unwrap();
    assert_eq!(out, Value::Int32(7));
    assert!(rejected.get());
}

#[test]
fn test_compile_and_call_under_one_budget() {
    let mut interp = sandboxed(Duration::from_secs(5));
    interp
        .define_function("add2", "ii", "i", |args| {
            let (Value::Int32(a), Value::Int32(b)) = (&args[0], &args[1]) else {
                anyhow::bail!("expected two integers");
            };
            Ok(Value::Int32(a + b))
        })
        .unwrap();

    let out = interp
        .compile_and_call_with_timeout(
            Some("function test() { return add2(40, 2); }"),
            "test",
            &[],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(out, Value::Int32(42));
    assert!(!interp.timed_out());

    // A script with no entry point still compiles cleanly.
    let out = interp
        .compile_and_call_with_timeout(Some("var y = 2;"), "startup", &[], Duration::from_secs(5))
        .unwrap();
    assert_eq!(out, Value::Void);
}

#[test]
fn test_compile_and_call_times_out_on_a_runaway_script() {
    let mut interp = sandboxed(Duration::from_secs(10));
    let result = interp.compile_and_call_with_timeout(
        Some("function test() { while (true) {} }"),
        "test",
        &[],
        Duration::from_secs(1),
    );
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    assert!(interp.timed_out());
}

#[test]
fn test_unsandboxed_interpreter_runs_in_process() {
    let config = SandboxConfig::default();
    let mut interp = Interpreter::by_extension_unsandboxed("guest.js", &config).unwrap();
    interp.define_int_constant("global_int", 3).unwrap();
    interp
        .compile_script("function test() { return global_int + 39; }")
        .unwrap();
    assert_eq!(interp.call_int_function("test").unwrap(), 42);

    // A non-integer result is a conversion failure for int callers.
    interp
        .compile_script(r#"function str() { return "nope"; }"#)
        .unwrap();
    let result = interp.call_int_function("str");
    assert!(matches!(result, Err(Error::Convert(_))), "{result:?}");
    assert!(interp.last_error().is_some());
}
