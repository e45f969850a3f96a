use anyhow::Result;
use serpent::{Error, Program};

use super::common::runtime;

fn run_failure(source: &str) -> Option<String> {
    let runtime = runtime()?;
    let program = Program::<String, String>::new(source);
    match runtime.run(&program, &"test".to_string()) {
        Err(Error::RunFailed(detail)) => Some(detail),
        other => panic!("expected RunFailed for {source:?}, got {other:?}"),
    }
}

#[test]
fn integration_python_syntax_error() {
    if let Some(detail) = run_failure("def run(input): (") {
        assert!(detail.starts_with("SyntaxError: "), "{detail}");
        assert!(detail.contains("was never closed"), "{detail}");
    }
}

#[test]
fn integration_python_name_error() {
    if let Some(detail) = run_failure("def run(input): return undefined_var") {
        assert_eq!(detail, "NameError: name 'undefined_var' is not defined");
    }
}

#[test]
fn integration_python_zero_division() {
    if let Some(detail) = run_failure("def run(input): return 1 / 0") {
        assert_eq!(detail, "ZeroDivisionError: division by zero");
    }
}

#[test]
fn integration_python_type_error() {
    if let Some(detail) = run_failure("def run(input): return 'string' + 1") {
        assert!(detail.starts_with("TypeError: "), "{detail}");
        assert!(detail.contains("can only concatenate str"), "{detail}");
    }
}

#[test]
fn integration_python_no_entry_point() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<String, String>::new("x = 1");
    let err = runtime.run(&program, &"test".to_string()).unwrap_err();
    assert!(matches!(err, Error::NoResult), "{err}");
    Ok(())
}

#[test]
fn integration_python_unserializable_result() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<(), String>::new("def run(input): return object()");
    let err = runtime.run(&program, &()).unwrap_err();
    let Error::RunFailed(detail) = err else {
        panic!("expected RunFailed, got {err:?}");
    };
    assert!(detail.starts_with("TypeError: "), "{detail}");
    Ok(())
}

#[test]
fn integration_python_error_does_not_poison_worker() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let failing = Program::<(), i64>::new("def run(input): raise ValueError('boom')");
    let working = Program::<(), i64>::new("def run(input): return 7");
    for _ in 0..8 {
        let err = runtime.run(&failing, &()).unwrap_err();
        assert_eq!(err.to_string(), "run failed: ValueError: boom");
        assert_eq!(runtime.run(&working, &())?, 7);
    }
    Ok(())
}
