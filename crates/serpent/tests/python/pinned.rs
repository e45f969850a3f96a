use std::thread;

use anyhow::{Context, Result};
use serpent::{Error, Program};

use super::common::runtime;

const ACCUMULATOR: &str = "
counter = 0
def run(input):
    global counter
    counter += input
    return counter
";

#[test]
fn integration_python_pinned_single_call() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load(&Program::<i64, i64>::new("def run(input): return input + 2"));
    assert_eq!(exec.run(&1)?, 3);
    exec.close();
    Ok(())
}

#[test]
fn integration_python_pinned_state_persists() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load(&Program::<i64, i64>::new(ACCUMULATOR));
    for (input, expected) in [(1, 1), (2, 3), (3, 6)] {
        assert_eq!(exec.run(&input).with_context(|| format!("run({input})"))?, expected);
    }
    Ok(())
}

#[test]
fn integration_python_pinned_multiple_calls() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load(&Program::<i64, i64>::new("def run(input): return input * 2"));
    for i in 0..5 {
        assert_eq!(exec.run(&i)?, i * 2);
    }
    Ok(())
}

#[test]
fn integration_python_pinned_parallel_calls() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load(&Program::<i64, i64>::new("def run(input): return input + 1"));
    thread::scope(|scope| {
        let handles: Vec<_> = (0..20_i64)
            .map(|i| {
                let exec = &exec;
                scope.spawn(move || (i, exec.run(&i)))
            })
            .collect();
        for handle in handles {
            let (i, result) = handle.join().expect("caller panicked");
            assert_eq!(result.with_context(|| format!("run({i})"))?, i + 1);
        }
        anyhow::Ok(())
    })?;
    assert!(exec.worker().is_some());
    Ok(())
}

#[test]
fn integration_python_pinned_close_resets_state() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load(&Program::<i64, i64>::new(ACCUMULATOR));
    assert_eq!(exec.run(&5)?, 5);
    exec.close();
    exec.close();
    assert_eq!(exec.run(&1)?, 1);
    Ok(())
}

#[test]
fn integration_python_pinned_result_binding_reruns() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load(&Program::<i64, i64>::new("result = input * 2"));
    for i in [1, 5, 7] {
        assert_eq!(exec.run(&i).with_context(|| format!("run({i})"))?, i * 2);
    }
    Ok(())
}

#[test]
fn integration_python_pinned_result_binding_is_not_stale() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load(&Program::<String, String>::new(
        "if input == 'a':\n    result = 'A'\n",
    ));
    assert_eq!(exec.run(&"a".to_string())?, "A");
    let err = exec.run(&"b".to_string()).unwrap_err();
    assert!(matches!(err, Error::NoResult), "{err}");
    assert_eq!(exec.run(&"a".to_string())?, "A");
    Ok(())
}
