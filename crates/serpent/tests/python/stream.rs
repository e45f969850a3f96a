use std::thread;

use anyhow::{Context, Result};
use serpent::{Error, Program, Writer};

use super::common::runtime;

#[test]
fn integration_python_write_ok() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<(), Writer>::new("def run(input, writer):\n    writer.write(b'OK')\n");
    let mut sink = Vec::new();
    runtime.run_write(&mut sink, &program, &())?;
    assert_eq!(sink, b"OK");
    Ok(())
}

#[test]
fn integration_python_write_large_output() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<usize, Writer>::new(
        "def run(input, writer):\n    for _ in range(input):\n        writer.write('x' * 1024)\n    writer.flush()\n",
    );
    let mut sink = Vec::new();
    runtime.run_write(&mut sink, &program, &512)?;
    assert_eq!(sink.len(), 512 * 1024);
    assert!(sink.iter().all(|&b| b == b'x'));
    Ok(())
}

const CHUNKED: &str = "
def run(input, writer):
    for i in range(input):
        writer.write(bytes([i % 251]) * 1024)
";

fn chunked(chunks: usize) -> Vec<u8> {
    (0..chunks)
        .flat_map(|i| std::iter::repeat_n(u8::try_from(i % 251).unwrap(), 1024))
        .collect()
}

#[test]
fn integration_python_write_repeated_large_output() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<usize, Writer>::new(CHUNKED);
    let expected = chunked(256);
    thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    for run in 0..13 {
                        let mut sink = Vec::new();
                        runtime
                            .run_write(&mut sink, &program, &256)
                            .with_context(|| format!("run {run}"))?;
                        assert_eq!(sink.len(), 256 * 1024, "run {run}");
                        assert!(sink == expected, "run {run}: output differs");
                    }
                    anyhow::Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("caller panicked")?;
        }
        anyhow::Ok(())
    })
}

#[test]
fn integration_python_writer_executable_repeated_large_output() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load_writer(&Program::<usize, Writer>::new(CHUNKED));
    let expected = chunked(300);
    for run in 0..50 {
        let mut sink = Vec::new();
        exec.run(&mut sink, &300).with_context(|| format!("run {run}"))?;
        assert_eq!(sink.len(), 300 * 1024, "run {run}");
        assert!(sink == expected, "run {run}: output differs");
    }
    exec.close();
    Ok(())
}

#[test]
fn integration_python_write_error_after_output() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<(), Writer>::new(
        "def run(input, writer):\n    writer.write(b'partial')\n    raise RuntimeError('halfway')\n",
    );
    let mut sink = Vec::new();
    let err = runtime.run_write(&mut sink, &program, &()).unwrap_err();
    assert!(matches!(err, Error::RunFailed(ref m) if m == "RuntimeError: halfway"), "{err}");
    assert_eq!(sink, b"partial");
    Ok(())
}

#[test]
fn integration_python_writer_executable_multiple_calls() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load_writer(&Program::<i64, Writer>::new(
        "def run(input, writer):\n    writer.write(str(input * 2).encode())\n",
    ));
    for i in 1..=3 {
        let mut sink = Vec::new();
        exec.run(&mut sink, &i)?;
        assert_eq!(String::from_utf8(sink)?, (i * 2).to_string());
    }
    exec.close();
    Ok(())
}

#[test]
fn integration_python_writer_executable_string() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let exec = runtime.load_writer(&Program::<String, Writer>::new(
        "def run(input, writer):\n    writer.write(input.encode())\n",
    ));
    let mut sink = Vec::new();
    exec.run(&mut sink, &"pinned".to_string())?;
    assert_eq!(sink, b"pinned");
    Ok(())
}
