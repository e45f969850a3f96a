use std::thread;

use anyhow::{Context, Result};
use serde::Serialize;
use serpent::Program;

use super::common::runtime;

#[test]
fn integration_python_add() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<i64, i64>::new("def run(input): return input + 2");
    let result = runtime.run(&program, &1).context("failed to run program")?;
    assert_eq!(result, 3);
    Ok(())
}

#[test]
fn integration_python_record_input() -> Result<()> {
    #[derive(Serialize)]
    struct Named {
        #[serde(rename = "Name")]
        name: String,
    }

    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<Named, String>::new("def run(input): return input['Name']");
    let input = Named {
        name: "test".to_string(),
    };
    assert_eq!(runtime.run(&program, &input)?, "test");
    Ok(())
}

#[test]
fn integration_python_escaped_string() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<String, String>::new("def run(input): return input");
    let input = "\"test\"".to_string();
    assert_eq!(runtime.run(&program, &input)?, input);
    Ok(())
}

#[test]
fn integration_python_source_is_not_interpolated() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<String, String>::new(
        "def run(input):\n    return '''\"\"\"''' + input + \"'''\"",
    );
    assert_eq!(runtime.run(&program, &"\\n".to_string())?, "\"\"\"\\n'''");
    Ok(())
}

#[test]
fn integration_python_import_twice() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<i64, i64>::new("import os\ndef run(input): return input + 2");
    runtime.run(&program, &1).context("first run")?;
    runtime.run(&program, &1).context("second run")?;
    Ok(())
}

#[test]
fn integration_python_function_scope() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<(), i64>::new(
        "import math\ndef calc():\n    return int(math.sqrt(4))\ndef run(input):\n    return calc()\n",
    );
    assert_eq!(runtime.run(&program, &())?, 2);
    Ok(())
}

#[test]
fn integration_python_result_binding() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<i64, i64>::new("result = input + 2");
    assert_eq!(runtime.run(&program, &1)?, 3);
    Ok(())
}

#[test]
fn integration_python_concurrent_calls() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<(), i64>::new("def run(input): return 1 + 1");
    thread::scope(|scope| {
        let handles: Vec<_> = (0..10)
            .map(|_| scope.spawn(|| runtime.run(&program, &())))
            .collect();
        for (index, handle) in handles.into_iter().enumerate() {
            let result = handle.join().expect("caller panicked");
            assert_eq!(result.with_context(|| format!("call {index}"))?, 2);
        }
        Ok(())
    })
}

#[test]
fn integration_python_async_calls() -> Result<()> {
    let Some(runtime) = runtime() else {
        return Ok(());
    };
    let program = Program::<i64, i64>::new("def run(input): return input * 3");
    let executor = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .build()?;
    let results = executor.block_on(async {
        let (a, b, c) = tokio::join!(
            runtime.run_async(&program, &1),
            runtime.run_async(&program, &2),
            runtime.run_async(&program, &3),
        );
        anyhow::Ok((a?, b?, c?))
    })?;
    assert_eq!(results, (3, 6, 9));
    Ok(())
}
