use std::{env::args, fs, path::Path};

use anyhow::{Context, anyhow};
use serde_json::Value;
use serpent::{Program, Python, Runtime, Writer};
use utils::logging::init_tracing;

mod utils;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let task = args().nth(1);
    match task.as_deref() {
        Some("lib") => {
            println!("{}", serpent::lib()?.display());
            Ok(())
        }
        Some("probe") => {
            let library = serpent::lib()?;
            let python = Python::open(&library)
                .with_context(|| format!("failed to load {}", library.display()))?;
            let capabilities = python.capabilities();
            println!("library:   {}", library.display());
            match capabilities.version {
                Some(version) => println!("version:   {version}"),
                None => println!("version:   unknown"),
            }
            println!("isolation: {}", capabilities.isolation);
            Ok(())
        }
        Some("run") => {
            let (source, input) = program_args()?;
            let runtime = start()?;
            let program = Program::<Value, Value>::new(source);
            let output = runtime.run(&program, &input)?;
            println!("{output}");
            runtime.close()?;
            Ok(())
        }
        Some("stream") => {
            let (source, input) = program_args()?;
            let runtime = start()?;
            let program = Program::<Value, Writer>::new(source);
            runtime.run_write(&mut std::io::stdout(), &program, &input)?;
            runtime.close()?;
            Ok(())
        }
        _ => Err(anyhow!(
            "unknown task; usage: serpent <lib|probe|run|stream> [program.py] [json-input]"
        )),
    }
}

/// `<program.py> [json-input]`; the input defaults to `null`.
fn program_args() -> anyhow::Result<(String, Value)> {
    let path = args().nth(2).context("missing program path")?;
    let source = fs::read_to_string(Path::new(&path))
        .with_context(|| format!("failed to read {path}"))?;
    let input = match args().nth(3) {
        Some(raw) => serde_json::from_str(&raw).context("input is not valid JSON")?,
        None => Value::Null,
    };
    Ok((source, input))
}

fn start() -> anyhow::Result<Runtime> {
    let library = serpent::lib().context("no libpython found; set LIBPYTHON_PATH")?;
    let runtime = Runtime::new(library);
    let report = runtime.init()?;
    for failure in &report.failures {
        tracing::warn!("{failure}");
    }
    tracing::debug!(workers = report.workers, isolated = report.isolated, "runtime ready");
    Ok(runtime)
}
