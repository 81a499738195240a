use std::{
    env,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result, anyhow, bail};
use pyhost::{
    Args, BridgeError, Config, EnvironmentDescriptor, EnvironmentResolver, Runtime,
    TRACE_TARGET_SCRIPT, Value,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

const CONFIG_VAR: &str = "PYHOST_CONFIG";
const PATH_VAR: &str = "PYHOST_PATH";

type Task = fn(&[String]) -> Result<()>;
const TASKS: &[(&str, &str, Task)] = &[
    ("info", "show the resolved environment and sys.path", info),
    ("run", "<script.py>  run a script as __main__", run),
    (
        "call",
        "<module>:<function> [json-args]  call a function and print its result as JSON",
        call,
    ),
    ("eval", "<expression>  evaluate an expression and print it", eval),
];

fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    let args: Vec<String> = env::args().skip(1).collect();
    let Some((task, rest)) = args.split_first() else {
        print_help();
        return ExitCode::SUCCESS;
    };
    let Some(f) = TASKS
        .iter()
        .find_map(|(name, _, f)| (*name == task.as_str()).then_some(*f))
    else {
        print_help();
        return ExitCode::FAILURE;
    };

    match f(rest) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<BridgeError>() {
                Some(bridge) => eprintln!("error: {}", bridge.report()),
                None => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    println!("Usage: pyhost <task> [args]");
    println!();
    println!("Tasks:");
    for (name, help, _) in TASKS {
        println!("  {name:<6} {help}");
    }
    println!();
    println!("Environment:");
    println!("  {CONFIG_VAR}  JSON configuration file");
    println!("  {PATH_VAR}    extra module search directories");
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::WARN.into())
        .from_env()?
        .add_directive(format!("{TRACE_TARGET_SCRIPT}=info").parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("{e}"))
}

fn load_config() -> Result<Config> {
    let mut config = match env::var_os(CONFIG_VAR) {
        Some(path) => Config::from_path(Path::new(&path))
            .with_context(|| format!("failed to load {}", Path::new(&path).display()))?,
        None => Config::default(),
    };
    if let Some(paths) = env::var_os(PATH_VAR) {
        config
            .runtime
            .search_paths
            .extend(env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()));
    }
    Ok(config)
}

fn resolve(config: &Config) -> Result<EnvironmentDescriptor> {
    Ok(EnvironmentResolver::new(config.environment.clone()).resolve()?)
}

fn info(_args: &[String]) -> Result<()> {
    let config = load_config()?;
    let descriptor = resolve(&config)?;
    println!("home:     {}", descriptor.home().display());
    println!("source:   {:?}", descriptor.source());
    println!("version:  {}", descriptor.version());
    for dir in descriptor.stdlib_paths() {
        println!("stdlib:   {}", dir.display());
    }
    if let Some(venv) = descriptor.venv() {
        println!("venv:     {}", venv.root.display());
    }

    let runtime = Runtime::acquire_with(&descriptor, config.runtime)?;
    let (version, path) = runtime.enter(|bridge| -> pyhost::Result<_> {
        Ok((bridge.interpreter_version().to_owned(), bridge.sys_path()?))
    })?;
    runtime.release()?;

    println!("runtime:  {}", version.lines().next().unwrap_or_default());
    for entry in path {
        println!("sys.path: {entry}");
    }
    Ok(())
}

fn run(args: &[String]) -> Result<()> {
    let [script] = args else {
        bail!("usage: pyhost run <script.py>");
    };
    let script = std::path::absolute(script)?;
    let mut config = load_config()?;
    if let Some(dir) = script.parent() {
        config.runtime.search_paths.insert(0, dir.to_path_buf());
    }
    let descriptor = resolve(&config)?;

    let runtime = Runtime::acquire_with(&descriptor, config.runtime)?;
    runtime.enter(|bridge| bridge.run_file(&script, &bridge.scope()))?;
    runtime.release()?;
    Ok(())
}

fn call(args: &[String]) -> Result<()> {
    let (target, json) = match args {
        [target] => (target, None),
        [target, json] => (target, Some(json)),
        _ => bail!("usage: pyhost call <module>:<function> [json-args]"),
    };
    let (module, function) = target
        .split_once(':')
        .with_context(|| format!("expected <module>:<function>, got '{target}'"))?;
    let arguments = match json {
        Some(json) => parse_arguments(json)?,
        None => Vec::new(),
    };

    let mut config = load_config()?;
    config.runtime.search_paths.push(PathBuf::from("."));
    let descriptor = resolve(&config)?;

    let runtime = Runtime::acquire_with(&descriptor, config.runtime)?;
    let result = runtime.enter(|bridge| {
        let callable = bridge.load_module(module)?.attr(function)?;
        let args = arguments.into_iter().fold(Args::new(), |args, v| args.arg(v));
        callable.call(args)?.to_value()
    })?;
    runtime.release()?;

    println!("{}", serde_json::to_string_pretty(&result.to_json()?)?);
    Ok(())
}

fn eval(args: &[String]) -> Result<()> {
    let [expr] = args else {
        bail!("usage: pyhost eval <expression>");
    };
    let config = load_config()?;
    let descriptor = resolve(&config)?;

    let runtime = Runtime::acquire_with(&descriptor, config.runtime)?;
    let rendered = runtime.enter(|bridge| -> pyhost::Result<String> {
        let value = bridge.eval(expr, None)?;
        Ok(match value.to_value() {
            Ok(value) => value
                .to_json()
                .map_or_else(|_| format!("{value:?}"), |json| json.to_string()),
            Err(_) => value.repr(),
        })
    })?;
    runtime.release()?;

    println!("{rendered}");
    Ok(())
}

/// Arguments are a JSON array of positional values, or a single value.
fn parse_arguments(json: &str) -> Result<Vec<Value>> {
    let parsed: serde_json::Value =
        serde_json::from_str(json).with_context(|| format!("invalid JSON arguments: {json}"))?;
    match parsed {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| Value::from_json(item).map_err(Into::into))
            .collect(),
        other => Ok(vec![Value::from_json(other)?]),
    }
}
