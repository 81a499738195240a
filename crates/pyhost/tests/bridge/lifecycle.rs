use anyhow::{Context, Result};
use pyhost::{
    BridgeError, EnvironmentOverrides, EnvironmentResolver, PythonVersion, Runtime,
    RuntimeOptions,
};

use super::common::{acquire, acquire_with, descriptor, fixture_dir, lock};

#[test]
fn integration_bridge_single_live_runtime() -> Result<()> {
    let Some(descriptor) = descriptor() else {
        return Ok(());
    };
    let _guard = lock();

    let runtime = Runtime::acquire(&descriptor).context("failed to acquire runtime")?;
    assert!(Runtime::is_live());

    let err = Runtime::acquire(&descriptor)
        .err()
        .context("expected second acquire to fail")?;
    let BridgeError::RuntimeStart { reason } = &err else {
        panic!("expected runtime start error, got {err:?}");
    };
    assert!(
        reason.contains("already live"),
        "unexpected error message: {reason}"
    );
    assert!(!err.is_recoverable());

    runtime.release().context("failed to release runtime")?;
    assert!(!Runtime::is_live());

    let again = Runtime::acquire(&descriptor).context("failed to re-acquire runtime")?;
    let value: i64 = again.enter(|bridge| bridge.eval("6 * 7", None)?.extract())?;
    assert_eq!(value, 42);
    drop(again);
    assert!(!Runtime::is_live());
    Ok(())
}

#[test]
fn integration_bridge_generations_advance() -> Result<()> {
    let Some(descriptor) = descriptor() else {
        return Ok(());
    };
    let _guard = lock();

    let first = Runtime::acquire(&descriptor).context("failed to acquire runtime")?;
    let first_generation = first.generation();
    let handle = first.enter(|bridge| {
        assert_eq!(bridge.generation(), first_generation);
        bridge.eval("[1, 2, 3]", None).map(pyhost::ForeignValue::detach)
    })?;
    assert_eq!(handle.generation(), first_generation);

    let len: usize = first.enter(|bridge| {
        let list = bridge.attach(&handle)?;
        bridge.eval("len", None)?.call(pyhost::args![@foreign(list)]?)?.extract()
    })?;
    assert_eq!(len, 3);
    first.release().context("failed to release first runtime")?;

    let second = Runtime::acquire(&descriptor).context("failed to acquire second runtime")?;
    assert!(second.generation() > first_generation);
    let err = second
        .enter(|bridge| bridge.attach(&handle).map(|v| v.repr()))
        .expect_err("expected stale handle to be rejected");
    let BridgeError::StaleValue { issued, current } = err else {
        panic!("expected stale value error, got {err:?}");
    };
    assert_eq!(issued, first_generation);
    assert_eq!(current, second.generation());
    Ok(())
}

#[test]
fn integration_bridge_sys_path_restored_on_release() -> Result<()> {
    let dir = fixture_dir()?;
    let Some(runtime) = acquire_with(RuntimeOptions::default().search_path(dir.path()))? else {
        return Ok(());
    };
    let entry = dir.path().to_string_lossy().into_owned();

    let (before, added) = runtime.enter(|bridge| -> pyhost::Result<_> {
        let path = bridge.sys_path()?;
        Ok((path.len(), path.contains(&entry)))
    })?;
    assert!(added, "expected {entry} on sys.path");
    runtime.release().context("failed to release runtime")?;

    let Some(runtime) = acquire()? else {
        return Ok(());
    };
    let path = runtime.enter(|bridge| bridge.sys_path())?;
    assert!(!path.contains(&entry), "search path leaked: {path:?}");
    assert_eq!(path.len(), before - 1);
    Ok(())
}

#[test]
fn integration_bridge_prelude_runs_after_setup() -> Result<()> {
    let options = RuntimeOptions::default().prelude(
        "
        import sys
        import _pyhost_logging
        sys.pyhost_prelude_marker = 'ready'
        ",
    );
    let Some(runtime) = acquire_with(options)? else {
        return Ok(());
    };

    let marker: String = runtime.enter(|bridge| {
        let value = bridge.eval("__import__('sys').pyhost_prelude_marker", None)?;
        let scope = bridge.scope();
        bridge.exec("import sys\ndel sys.pyhost_prelude_marker", &scope)?;
        value.extract()
    })?;
    assert_eq!(marker, "ready");
    Ok(())
}

#[test]
fn integration_bridge_failing_prelude_is_runtime_start() -> Result<()> {
    let Some(descriptor) = descriptor() else {
        return Ok(());
    };
    let _guard = lock();

    let options = RuntimeOptions::default().prelude("raise ValueError('prelude exploded')");
    let err = Runtime::acquire_with(&descriptor, options)
        .err()
        .context("expected failing prelude to abort acquisition")?;
    let BridgeError::RuntimeStart { reason } = &err else {
        panic!("expected runtime start error, got {err:?}");
    };
    assert!(
        reason.contains("prelude exploded"),
        "unexpected error message: {reason}"
    );
    assert!(!Runtime::is_live());

    let runtime = Runtime::acquire(&descriptor).context("failed to acquire after failure")?;
    runtime.release().context("failed to release runtime")?;
    Ok(())
}

#[test]
#[cfg(unix)]
fn integration_bridge_rejects_second_home() -> Result<()> {
    let Some(descriptor) = descriptor() else {
        return Ok(());
    };
    let _guard = lock();

    // Make sure the interpreter is already running with the real home.
    Runtime::acquire(&descriptor)
        .context("failed to acquire runtime")?
        .release()?;

    let version = PythonVersion::linked();
    let fake = tempfile::tempdir().context("failed to create fake home")?;
    let stdlib = fake
        .path()
        .join("lib")
        .join(format!("python{}.{}", version.major, version.minor));
    std::fs::create_dir_all(&stdlib)?;
    std::fs::write(stdlib.join("os.py"), "")?;

    let other = EnvironmentResolver::new(
        EnvironmentOverrides::default()
            .home(fake.path())
            .use_process_env(false),
    )
    .resolve()
    .context("failed to resolve fake home")?;

    let err = Runtime::acquire(&other)
        .err()
        .context("expected a different home to be rejected")?;
    let BridgeError::RuntimeStart { reason } = &err else {
        panic!("expected runtime start error, got {err:?}");
    };
    assert!(
        reason.contains("cannot switch"),
        "unexpected error message: {reason}"
    );
    assert!(!Runtime::is_live());
    Ok(())
}

#[test]
fn integration_bridge_runtime_crosses_threads() -> Result<()> {
    let Some(runtime) = acquire()? else {
        return Ok(());
    };

    let results = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4_i64)
            .map(|i| {
                let runtime = &runtime;
                s.spawn(move || {
                    runtime.enter(|bridge| bridge.eval(&format!("{i} * 10"), None)?.extract::<i64>())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker thread panicked"))
            .collect::<pyhost::Result<Vec<_>>>()
    })?;
    assert_eq!(results, vec![0, 10, 20, 30]);

    let doubled = runtime.enter(|bridge| bridge.detach(|| 21 * 2));
    assert_eq!(doubled, 42);
    Ok(())
}
