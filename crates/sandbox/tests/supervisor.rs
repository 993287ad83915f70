//! Protocol-level supervisor tests, driven by the MockEngine adapter so
//! they exercise the fork/pipe/frame machinery without embedding a real
//! interpreter.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use engine::testutil::MockEngine;
use engine::{Callback, Engine, Error};
use sandbox::{Sandbox, SandboxConfig};
use value::Value;

fn config_with_deadline(deadline: Duration) -> SandboxConfig {
    SandboxConfig {
        call_deadline: deadline,
        ..SandboxConfig::default()
    }
}

fn config() -> SandboxConfig {
    config_with_deadline(Duration::from_secs(5))
}

#[test]
fn test_string_callback_round_trip() {
    let engine = MockEngine::new().with_function("test", |ctx, _| {
        ctx.call("concat_strings", &[Value::from("foo"), Value::from("bar")])
    });
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    let calls = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&calls);
    sandbox
        .define_callback(
            "concat_strings",
            Callback::new("ss", "s", move |args| {
                counter.set(counter.get() + 1);
                let (Value::String(a), Value::String(b)) = (&args[0], &args[1]) else {
                    anyhow::bail!("arguments were not strings");
                };
                Ok(Value::String(format!("{a}{b}")))
            })
            .unwrap(),
        )
        .unwrap();

    sandbox.compile_script("function test() {}").unwrap();
    assert!(sandbox.is_function("test").unwrap());
    assert!(!sandbox.is_function("missing").unwrap());

    let out = sandbox.call_function("test", &[]).unwrap();
    assert_eq!(out, Value::String("foobar".to_string()));
    // Exactly one callback exchange crossed the boundary.
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_array_callback_round_trip() {
    let engine = MockEngine::new().with_function("test", |ctx, _| {
        ctx.call(
            "concat_arrays",
            &[
                Value::Array(vec![Value::Int32(1), Value::Int32(2)]),
                Value::Array(vec![Value::Int32(3), Value::Int32(4)]),
            ],
        )
    });
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    sandbox
        .define_callback(
            "concat_arrays",
            Callback::new("[[", "[", |args| {
                let (Value::Array(a), Value::Array(b)) = (&args[0], &args[1]) else {
                    anyhow::bail!("arguments were not arrays");
                };
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::Array(out))
            })
            .unwrap(),
        )
        .unwrap();

    sandbox.compile_script("function test() {}").unwrap();
    let out = sandbox.call_function("test", &[]).unwrap();
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
fn test_constants_reach_the_child() {
    let engine = MockEngine::new().with_function("test", |ctx, _| {
        Ok(ctx.constant("global_int").cloned().unwrap_or(Value::Void))
    });
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    sandbox.define_constant("global_int", &Value::Int32(3)).unwrap();
    let out = sandbox.call_function("test", &[]).unwrap();
    assert_eq!(out, Value::Int32(3));
}

#[test]
fn test_arguments_reach_the_child_and_back() {
    let engine = MockEngine::new().with_function("echo", |_, args| {
        Ok(Value::Array(args.to_vec()))
    });
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    let args = [Value::Int32(1), Value::String("two".to_string())];
    let out = sandbox.call_function("echo", &args).unwrap();
    assert_eq!(out, Value::Array(args.to_vec()));
}

#[test]
fn test_guest_logs_are_forwarded() {
    let engine = MockEngine::new().with_function("test", |ctx, _| {
        ctx.log("hello from the guest");
        Ok(Value::Void)
    });
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    let logs = Rc::new(RefCell::new(Vec::new()));
    let collected = Rc::clone(&logs);
    sandbox.set_log_sink(Rc::new(move |message: &str| {
        collected.borrow_mut().push(message.to_string());
    }));

    sandbox.call_function("test", &[]).unwrap();
    assert_eq!(logs.borrow().as_slice(), &["hello from the guest".to_string()]);
}

#[test]
fn test_infinite_loop_hits_the_deadline() {
    let engine = MockEngine::new().with_function("test", |_, _| loop {
        std::hint::spin_loop();
    });
    let mut sandbox =
        Sandbox::spawn(Box::new(engine), &config_with_deadline(Duration::from_millis(300)))
            .unwrap();

    let started = Instant::now();
    let result = sandbox.call_function("test", &[]);
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    assert!(sandbox.timed_out());
    assert!(started.elapsed() < Duration::from_secs(3));

    // Dropping force-kills the spinning child and reaps it.
    let started = Instant::now();
    drop(sandbox);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_reentrant_invocation_is_rejected() {
    let engine =
        MockEngine::new().with_function("test", |ctx, _| ctx.call("evil", &[]));
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    let handle = sandbox.handle();
    let rejected = Rc::new(Cell::new(false));
    let saw = Rc::clone(&rejected);
    sandbox
        .define_callback(
            "evil",
            Callback::new("", "i", move |_| {
                // Attempting to re-enter the guest while it is blocked on
                // this very callback must fail without touching the pipe.
                match handle.call_function("test", &[]) {
                    Err(Error::Reentrant) => {
                        saw.set(true);
                        Ok(Value::Int32(7))
                    }
                    other => anyhow::bail!("re-entry was not rejected: {other:?}"),
                }
            })
            .unwrap(),
        )
        .unwrap();

    sandbox.compile_script("function test() { return evil(); }").unwrap();
    let out = sandbox.call_function("test", &[]).unwrap();
    assert_eq!(out, Value::Int32(7));
    assert!(rejected.get());
}

#[test]
fn test_deadline_spans_callbacks() {
    let engine = MockEngine::new().with_function("test", |ctx, _| {
        for _ in 0..20 {
            ctx.call("slow", &[])?;
        }
        Ok(Value::Void)
    });
    let mut sandbox =
        Sandbox::spawn(Box::new(engine), &config_with_deadline(Duration::from_millis(500)))
            .unwrap();

    let calls = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&calls);
    sandbox
        .define_callback(
            "slow",
            Callback::new("", "v", move |_| {
                counter.set(counter.get() + 1);
                std::thread::sleep(Duration::from_millis(150));
                Ok(Value::Void)
            })
            .unwrap(),
        )
        .unwrap();

    let started = Instant::now();
    let result = sandbox.call_function("test", &[]);
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    assert!(sandbox.timed_out());
    // The budget bounds the whole command, not each read in isolation.
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(calls.get() < 20, "ran {} callbacks", calls.get());
}

#[test]
fn test_child_death_is_surfaced_and_drop_does_not_block() {
    let engine =
        MockEngine::new().with_function("die", |_, _| unsafe { libc::_exit(3) });
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    let result = sandbox.call_function("die", &[]);
    assert!(matches!(result, Err(Error::ChildDied)), "{result:?}");
    assert!(!sandbox.timed_out());

    // The child has already exited; destroy must reap without blocking.
    let started = Instant::now();
    drop(sandbox);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_refused_initialization_reads_as_child_death() {
    let engine = MockEngine::new().refuse_initialize();
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    let result = sandbox.define_constant("x", &Value::Int32(1));
    assert!(matches!(result, Err(Error::ChildDied)), "{result:?}");
}

#[test]
fn test_compile_rejection() {
    let engine = MockEngine::new();
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    assert!(sandbox.compile_script("function test() {}").is_ok());
    let result = sandbox.compile_script("a syntax error here");
    assert!(matches!(result, Err(Error::Compile(_))), "{result:?}");

    // The child survives a rejected script and keeps serving commands.
    assert!(!sandbox.is_function("anything").unwrap());
}

#[test]
fn test_guest_errors_terminate_the_command_only() {
    let engine = MockEngine::new().with_function("test", |ctx, _| ctx.call("nope", &[]));
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    // "nope" was never registered, so the child-side dispatch fails and
    // the command terminates with an error frame.
    let result = sandbox.call_function("test", &[]);
    assert!(matches!(result, Err(Error::Guest(_))), "{result:?}");

    // Unknown guest functions surface the same way.
    let result = sandbox.call_function("missing", &[]);
    assert!(matches!(result, Err(Error::Guest(_))), "{result:?}");
}

#[test]
fn test_duplicate_callback_registration_is_rejected() {
    let engine = MockEngine::new();
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    let cb = || Callback::new("", "v", |_| Ok(Value::Void)).unwrap();
    sandbox.define_callback("trace", cb()).unwrap();
    let result = sandbox.define_callback("trace", cb());
    assert!(
        matches!(result, Err(Error::DuplicateCallback(ref name)) if name == "trace"),
        "{result:?}"
    );
}

#[test]
fn test_failed_callback_definition_does_not_poison_the_name() {
    let engine = MockEngine::new().reject_callback("flaky");
    let mut sandbox = Sandbox::spawn(Box::new(engine), &config()).unwrap();

    let cb = || Callback::new("", "v", |_| Ok(Value::Void)).unwrap();
    let result = sandbox.define_callback("flaky", cb());
    assert!(matches!(result, Err(Error::Guest(_))), "{result:?}");

    // The child never installed a proxy, so the name stays free: a retry
    // reaches the child again instead of dying on the parent's registry.
    let result = sandbox.define_callback("flaky", cb());
    assert!(matches!(result, Err(Error::Guest(_))), "{result:?}");

    // Other names are unaffected.
    sandbox.define_callback("steady", cb()).unwrap();
}
